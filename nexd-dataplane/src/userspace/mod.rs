//! Userspace back-end: terminates WireGuard in-process (via `boringtun`) and exposes the
//! decrypted traffic as a virtual NIC (`netstack::NetStack`) that `nexd-proxy` listens/dials on.
//! No kernel routes are touched; this is strictly an in-process relationship between sockets the
//! proxy opens and the `smoltcp` interface below.

mod device;
pub mod netstack;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use boringtun::noise::{Tunn, TunnResult};
use tokio::net::UdpSocket as TokioUdpSocket;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::{DataPlane, DataPlaneError, PeerConfig, PeerStats, PublicKey, encode_public_key};
use netstack::NetStack;

const WG_MAX_PACKET: usize = 2048;

struct PeerSession {
    config: PeerConfig,
    tunn: Mutex<Tunn>,
    socket: Arc<TokioUdpSocket>,
}

struct Inner {
    listen_port: u16,
    private_key: StaticSecret,
    peers: RwLock<BTreeMap<PublicKey, Arc<PeerSession>>>,
    net_stack: NetStack,
}

/// In-process WireGuard terminator plus the virtual NIC it feeds.
pub struct UserspaceDataPlane {
    inner: Mutex<Option<Arc<Inner>>>,
}

impl Default for UserspaceDataPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl UserspaceDataPlane {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Handle the proxy layer uses to listen/dial overlay addresses. `None` until `init` runs.
    pub fn net_stack(&self) -> Option<NetStack> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|inner| inner.net_stack.clone())
    }

    fn spawn_peer_rx_loop(inner: Arc<Inner>, session: Arc<PeerSession>, public_key: PublicKey) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; WG_MAX_PACKET];
            loop {
                let Ok(n) = session.socket.recv(&mut buf).await else {
                    tracing::debug!(
                        public_key = %encode_public_key(&public_key),
                        "peer UDP socket closed, ending receive loop"
                    );
                    return;
                };

                let mut out = vec![0u8; WG_MAX_PACKET];
                let result = {
                    let mut tunn = session.tunn.lock().expect("lock poisoned");
                    tunn.decapsulate(None, &buf[..n], &mut out)
                };

                match result {
                    TunnResult::WriteToNetwork(packet) => {
                        let _ = session.socket.send(packet).await;
                    }
                    TunnResult::WriteToTunnelV4(packet, _addr) => {
                        inner.net_stack.inject_inbound(packet.to_vec());
                    }
                    TunnResult::WriteToTunnelV6(packet, _addr) => {
                        inner.net_stack.inject_inbound(packet.to_vec());
                    }
                    TunnResult::Done => {}
                    TunnResult::Err(e) => {
                        tracing::debug!(?e, public_key = %encode_public_key(&public_key), "decapsulate error");
                    }
                }
            }
        });
    }

    /// Drains packets the virtual NIC wants sent, finds the owning peer by matching the
    /// destination against allowed-ips, and encrypts + ships them out.
    fn spawn_egress_pump(inner: Arc<Inner>) {
        tokio::spawn(async move {
            loop {
                inner.net_stack.poll();

                while let Some(packet) = inner.net_stack.drain_outbound() {
                    let Some(dest) = destination_of(&packet) else {
                        continue;
                    };

                    let peers = inner.peers.read().expect("lock poisoned");
                    let Some(session) = peers
                        .values()
                        .find(|p| p.config.allowed_ips.iter().any(|cidr| cidr.contains(dest)))
                        .cloned()
                    else {
                        tracing::trace!(%dest, "no peer owns this destination, dropping");
                        continue;
                    };
                    drop(peers);

                    let mut out = vec![0u8; WG_MAX_PACKET];
                    let result = {
                        let mut tunn = session.tunn.lock().expect("lock poisoned");
                        tunn.encapsulate(&packet, &mut out)
                    };

                    if let TunnResult::WriteToNetwork(ciphertext) = result {
                        let _ = session.socket.send(ciphertext).await;
                    }
                }

                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });
    }
}

fn destination_of(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(std::net::Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

impl DataPlane for UserspaceDataPlane {
    fn init(
        &self,
        private_key: &StaticSecret,
        listen_port: u16,
        v4: Option<IpAddr>,
        v6: Option<IpAddr>,
    ) -> Result<(), DataPlaneError> {
        use smoltcp::wire::IpCidr;

        let mut cidrs = Vec::new();
        if let Some(addr) = v4 {
            cidrs.push(IpCidr::new(addr.into(), 32));
        }
        if let Some(addr) = v6 {
            cidrs.push(IpCidr::new(addr.into(), 128));
        }

        let net_stack = NetStack::new(cidrs);
        let inner = Arc::new(Inner {
            listen_port,
            private_key: private_key.clone(),
            peers: RwLock::new(BTreeMap::new()),
            net_stack,
        });

        Self::spawn_egress_pump(inner.clone());
        *self.inner.lock().expect("lock poisoned") = Some(inner);

        Ok(())
    }

    fn set_peer(&self, peer: &PeerConfig) -> Result<(), DataPlaneError> {
        let guard = self.inner.lock().expect("lock poisoned");
        let inner = guard.as_ref().ok_or(DataPlaneError::NotInitialised)?.clone();
        drop(guard);

        {
            let peers = inner.peers.read().expect("lock poisoned");
            if peers.get(&peer.public_key).map(|p| &p.config) == Some(peer) {
                return Ok(()); // identical parameters, no-op
            }
        }

        let endpoint = peer.endpoint.ok_or_else(|| DataPlaneError::PeerProgram {
            public_key: encode_public_key(&peer.public_key),
            reason: "userspace back-end requires a resolved endpoint".into(),
        })?;

        let bind_addr: SocketAddr = match endpoint {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        };

        let std_socket = std::net::UdpSocket::bind(bind_addr)
            .and_then(|s| {
                s.connect(endpoint)?;
                s.set_nonblocking(true)?;
                Ok(s)
            })
            .map_err(|e| DataPlaneError::PeerProgram {
                public_key: encode_public_key(&peer.public_key),
                reason: e.to_string(),
            })?;
        let socket = Arc::new(TokioUdpSocket::from_std(std_socket).map_err(|e| {
            DataPlaneError::PeerProgram {
                public_key: encode_public_key(&peer.public_key),
                reason: e.to_string(),
            }
        })?);

        let peer_public = X25519PublicKey::from(peer.public_key);
        let tunn = Tunn::new(
            inner.private_key.clone(),
            peer_public,
            None,
            peer.persistent_keepalive.map(|d| d.as_secs() as u16),
            0,
            None,
        )
        .map_err(|e| DataPlaneError::PeerProgram {
            public_key: encode_public_key(&peer.public_key),
            reason: format!("{e:?}"),
        })?;

        let session = Arc::new(PeerSession {
            config: peer.clone(),
            tunn: Mutex::new(tunn),
            socket,
        });

        inner
            .peers
            .write()
            .expect("lock poisoned")
            .insert(peer.public_key, session.clone());

        Self::spawn_peer_rx_loop(inner, session, peer.public_key);

        Ok(())
    }

    fn remove_peer(&self, public_key: &PublicKey) -> Result<(), DataPlaneError> {
        let guard = self.inner.lock().expect("lock poisoned");
        let inner = guard.as_ref().ok_or(DataPlaneError::NotInitialised)?;
        inner.peers.write().expect("lock poisoned").remove(public_key);
        Ok(())
    }

    fn get_peer_stats(&self) -> BTreeMap<PublicKey, PeerStats> {
        let guard = self.inner.lock().expect("lock poisoned");
        let Some(inner) = guard.as_ref() else {
            return BTreeMap::new();
        };

        inner
            .peers
            .read()
            .expect("lock poisoned")
            .keys()
            .map(|key| (*key, PeerStats::default())) // partial data is acceptable for this back-end
            .collect()
    }

    fn close(&self) -> Result<(), DataPlaneError> {
        *self.inner.lock().expect("lock poisoned") = None;
        Ok(())
    }
}
