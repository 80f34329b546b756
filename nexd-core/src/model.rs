//! Shared data model: device records as the controller reports them, and the set-valued CIDR
//! comparison semantics the device cache's upsert classification depends on.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use ip_network::IpNetwork;
use nexd_dataplane::PublicKey;
use serde::{Deserialize, Serialize};

/// A CIDR list that compares as a *set*: order-insensitive, duplicates collapsed.
///
/// `equals([A,B], [B,A]) == true`; `equals([A,B], [A]) == false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CidrSet(HashSet<IpNetwork>);

impl CidrSet {
    pub fn new(cidrs: impl IntoIterator<Item = IpNetwork>) -> Self {
        Self(cidrs.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNetwork> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_overlap(&self, other: &CidrSet) -> bool {
        self.0.iter().any(|a| {
            other
                .0
                .iter()
                .any(|b| a.contains(b.network_address()) || b.contains(a.network_address()))
        })
    }
}

impl PartialEq for CidrSet {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for CidrSet {}

impl FromIterator<IpNetwork> for CidrSet {
    fn from_iter<T: IntoIterator<Item = IpNetwork>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonicalises an address by parsing then re-formatting; collapses equivalent textual forms
/// (e.g. `::1` vs `0:0:0:0:0:0:0:1`).
pub fn canonicalise_ip(addr: IpAddr) -> IpAddr {
    addr.to_string().parse().unwrap_or(addr)
}

pub fn canonicalise_socket_addr(addr: SocketAddr) -> SocketAddr {
    addr.to_string().parse().unwrap_or(addr)
}

/// A remote device as reconciled from the controller. Identified externally by its overlay
/// public key, which is the device cache's map key and therefore not a field here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub organization_id: String,
    pub hostname: String,
    pub overlay_ipv4: Option<IpAddr>,
    pub overlay_ipv6: Option<IpAddr>,
    pub local_endpoint: Option<SocketAddr>,
    pub reflexive_ipv4: Option<SocketAddr>,
    pub symmetric_nat: bool,
    pub relay: bool,
    pub child_prefixes: CidrSet,
    pub allowed_ips: CidrSet,
}

impl DeviceRecord {
    /// The endpoint the reconciler should hand to the data plane, by priority:
    /// explicit `local_endpoint` > reflexive v4 > nothing (last-known is the caller's job, since
    /// only the caller holds the previously-installed `PeerConfig`).
    pub fn preferred_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint.or(self.reflexive_ipv4)
    }
}

/// Per-peer reachability, produced atomically by the prober.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeepaliveStatus {
    pub overlay_ip: IpAddr,
    pub hostname: String,
    pub reachable: bool,
}

/// Public-key-keyed peer info as exposed over the `ListPeers` RPC.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerInfo {
    pub device_id: String,
    pub hostname: String,
    pub overlay_ipv4: Option<IpAddr>,
    pub overlay_ipv6: Option<IpAddr>,
    pub healthy: bool,
    pub last_handshake: Option<String>,
}

pub type PublicKeyMap<V> = std::collections::BTreeMap<PublicKey, V>;
