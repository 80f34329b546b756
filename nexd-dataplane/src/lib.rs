//! Polymorphic tunnel data plane.
//!
//! Two back-ends share one surface: [`kernel::KernelDataPlane`] programs a real WireGuard
//! interface in the host's network stack; [`userspace::UserspaceDataPlane`] runs the protocol
//! in-process and exposes a virtual NIC that `nexd-proxy` can listen/dial on. Callers only ever
//! see the [`DataPlane`] trait — which back-end is live is an implementation detail decided once,
//! at startup, by [`Mode::select`].

mod error;
pub mod kernel;
pub mod userspace;

pub use error::DataPlaneError;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ip_network::IpNetwork;

/// A WireGuard-style X25519 public key, base64 is the canonical textual form used everywhere
/// peers are logged, cached, or sent over the control RPC surface.
pub type PublicKey = [u8; 32];

pub fn encode_public_key(key: &PublicKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key)
}

pub fn decode_public_key(s: &str) -> Result<PublicKey, DataPlaneError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| DataPlaneError::InvalidPublicKey(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| DataPlaneError::InvalidPublicKey(s.to_string()))
}

/// Parameters for programming (or re-programming) a single peer.
///
/// `set_peer` with identical parameters for an already-installed peer must be a no-op on the
/// kernel back-end (WireGuard's own UAPI is idempotent by construction: re-applying identical
/// configuration is simply a repeat write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    pub persistent_keepalive: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub last_handshake: Option<std::time::SystemTime>,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// Mode-agnostic surface every caller (reconciler, proxy, RPC server) depends on.
///
/// Implementations serialise their own internal mutation: kernel syscalls are idempotent by
/// nature, the userspace back-end guards its peer table with an internal lock. Callers never
/// need their own lock around a `DataPlane` instance.
pub trait DataPlane: Send + Sync {
    /// Brings the tunnel interface up with the given keys, port and overlay addresses.
    fn init(
        &self,
        private_key: &x25519_dalek::StaticSecret,
        listen_port: u16,
        v4: Option<IpAddr>,
        v6: Option<IpAddr>,
    ) -> Result<(), DataPlaneError>;

    fn set_peer(&self, peer: &PeerConfig) -> Result<(), DataPlaneError>;

    fn remove_peer(&self, public_key: &PublicKey) -> Result<(), DataPlaneError>;

    /// Snapshot-read only: the data plane never hands back a live reference into its peer table,
    /// so the device cache remains the sole source of truth for peer identity and metadata.
    fn get_peer_stats(&self) -> BTreeMap<PublicKey, PeerStats>;

    fn close(&self) -> Result<(), DataPlaneError>;
}

/// Which back-end to run, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Kernel,
    Userspace,
}

impl Mode {
    /// Selection rule: proxy mode always implies userspace; otherwise kernel.
    pub fn select(proxy_mode: bool) -> Self {
        if proxy_mode { Mode::Userspace } else { Mode::Kernel }
    }
}
