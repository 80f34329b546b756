//! Dispatches each control-RPC method (spec §4.I) against the live subsystems. Kept as a plain
//! struct of `Arc`/`watch` handles rather than a trait object: every method here is a thin,
//! specific translation from wire request to an existing component call, so there is nothing a
//! trait boundary would usefully hide.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use nexd_core::device_cache::DeviceCache;
use nexd_core::model::PeerInfo;
use nexd_core::reconciler::ReconcilerState;
use nexd_dataplane::{DataPlane, PublicKey, encode_public_key};
use nexd_logging::LevelControl;
use nexd_probe::{Family, IcmpPinger, Prober};
use nexd_proxy::{Direction, ProxyManager};
use tokio::sync::watch;

use crate::error::RpcError;

pub struct RpcContext {
    pub cache: Arc<DeviceCache>,
    pub data_plane: Arc<dyn DataPlane>,
    pub proxy: Arc<ProxyManager>,
    pub reconciler_state: watch::Receiver<ReconcilerState>,
    pub auth_detail: Arc<std::sync::RwLock<Option<String>>>,
    pub level: LevelControl,
    pub local_public_key: PublicKey,
    pub local_is_relay: bool,
    pub tunnel_ipv4: Option<IpAddr>,
    pub tunnel_ipv6: Option<IpAddr>,
    pub version: &'static str,
}

impl RpcContext {
    /// Dispatches one request. Every error, including a malformed argument, is returned to the
    /// caller rather than ever aborting the process (spec §7, §9).
    pub async fn dispatch(&self, method: &str, arg: Option<String>) -> Result<String, RpcError> {
        match method {
            "Status" => Ok(self.status()),
            "Version" => Ok(self.version.to_string()),
            "GetTunnelIPv4" => self
                .tunnel_ipv4
                .map(|a| a.to_string())
                .ok_or(RpcError::NotAvailable("ipv4")),
            "GetTunnelIPv6" => self
                .tunnel_ipv6
                .map(|a| a.to_string())
                .ok_or(RpcError::NotAvailable("ipv6")),
            "ListPeers" => self.list_peers().await,
            "ConnectivityV4" => self.connectivity(Family::V4).await,
            "ConnectivityV6" => self.connectivity(Family::V6).await,
            "ProxyList" => Ok(self.proxy.list().await.join("\n")),
            "ProxyAddIngress" => self.proxy_add(Direction::Ingress, arg).await,
            "ProxyAddEgress" => self.proxy_add(Direction::Egress, arg).await,
            "ProxyRemoveIngress" => self.proxy_remove(Direction::Ingress, arg).await,
            "ProxyRemoveEgress" => self.proxy_remove(Direction::Egress, arg).await,
            "SetDebugOn" => self.set_debug(true),
            "SetDebugOff" => self.set_debug(false),
            "GetDebug" => Ok(self.level.is_debug().to_string()),
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }

    fn status(&self) -> String {
        let state = *self.reconciler_state.borrow();
        let mut out = format!("Status: {state}\n");
        if state == ReconcilerState::WaitingForAuth {
            if let Some(detail) = self.auth_detail.read().expect("lock poisoned").clone() {
                out.push_str(&detail);
                out.push('\n');
            }
        }
        out
    }

    async fn list_peers(&self) -> Result<String, RpcError> {
        let snapshot = self.cache.snapshot().await;
        let mut peers: BTreeMap<String, PeerInfo> = BTreeMap::new();

        for (key, entry) in snapshot {
            if key == self.local_public_key {
                continue; // spec §8: the local public key never appears in a peer enumeration
            }
            peers.insert(
                encode_public_key(&key),
                PeerInfo {
                    device_id: entry.record.device_id,
                    hostname: entry.record.hostname,
                    overlay_ipv4: entry.record.overlay_ipv4,
                    overlay_ipv6: entry.record.overlay_ipv6,
                    healthy: entry.peer_healthy,
                    last_handshake: entry.last_handshake.map(|t| humantime::format_rfc3339(t).to_string()),
                },
            );
        }

        serde_json::to_string(&peers).map_err(|e| RpcError::Config(e.to_string()))
    }

    async fn connectivity(&self, family: Family) -> Result<String, RpcError> {
        let prober = Prober::new(self.cache.clone(), IcmpPinger::new());
        let result = prober.probe(family, self.local_is_relay).await;
        serde_json::to_string(&result).map_err(|e| RpcError::Config(e.to_string()))
    }

    async fn proxy_add(&self, direction: Direction, arg: Option<String>) -> Result<String, RpcError> {
        let raw = arg.ok_or(RpcError::MissingArgument)?;
        let rule = self.proxy.add(direction, &raw, true).await?;
        Ok(format!("added {rule}"))
    }

    async fn proxy_remove(&self, direction: Direction, arg: Option<String>) -> Result<String, RpcError> {
        let raw = arg.ok_or(RpcError::MissingArgument)?;
        self.proxy.remove(direction, &raw).await?;
        Ok(format!("removed {raw}"))
    }

    fn set_debug(&self, on: bool) -> Result<String, RpcError> {
        self.level.set_debug(on).map_err(|e| RpcError::Config(e.to_string()))?;
        Ok(if on { "debug on".to_string() } else { "debug off".to_string() })
    }
}
