//! A running listener: one listening socket (ingress = overlay side, egress = host side) plus
//! the rules sharing it, TCP accept/splice loops, and — for UDP — the session table and its idle
//! sweeper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use nexd_dataplane::userspace::netstack::{NetStack, OverlayTcpStream, OverlayUdpSocket};
use rand::Rng as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener as HostTcpListener, TcpStream as HostTcpStream, UdpSocket as HostUdpSocket};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::rule::{Direction, ListenerKey, ProxyRule};

const SPLICE_BUFFER: usize = 16 * 1024;
const UDP_BUFFER: usize = 16 * 1024;
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A rule lifetime shorter than a `Listener`'s: the rule matching an inbound flow by
/// specific-source policy. We have no source CIDR in the rule model, so "the earlier rule wins"
/// (spec §4.G) simply means the first rule registered on the listener is the active destination.
pub struct Listener {
    pub key: ListenerKey,
    rules: Mutex<Vec<ProxyRule>>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Listener {
    pub async fn start(key: ListenerKey, first_rule: ProxyRule, net_stack: NetStack) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let destination: Arc<StdMutex<SocketAddr>> = Arc::new(StdMutex::new(SocketAddr::new(
            first_rule.destination_ip,
            first_rule.destination_port,
        )));
        let listener = Arc::new(Self {
            key,
            rules: Mutex::new(vec![first_rule]),
            cancel: cancel.clone(),
            tasks: Mutex::new(JoinSet::new()),
        });

        let mut tasks = listener.tasks.lock().await;
        match (key.direction, key.protocol) {
            (Direction::Ingress, crate::rule::Protocol::Tcp) => {
                tasks.spawn(run_tcp_ingress(net_stack, key.listen_port, destination, cancel.clone()));
            }
            (Direction::Egress, crate::rule::Protocol::Tcp) => {
                tasks.spawn(run_tcp_egress(net_stack, key.listen_port, destination, cancel.clone()));
            }
            (Direction::Ingress, crate::rule::Protocol::Udp) => {
                tasks.spawn(run_udp_ingress(net_stack, key.listen_port, destination, cancel.clone()));
            }
            (Direction::Egress, crate::rule::Protocol::Udp) => {
                tasks.spawn(run_udp_egress(net_stack, key.listen_port, destination, cancel.clone()));
            }
        }
        drop(tasks);

        listener
    }

    pub async fn add_rule(&self, rule: ProxyRule) {
        self.rules.lock().await.push(rule);
    }

    /// Removes a rule; returns `true` if the listener now has no rules left (caller should stop
    /// it).
    pub async fn remove_rule(&self, rule: &ProxyRule) -> bool {
        let mut rules = self.rules.lock().await;
        rules.retain(|r| !r.same_rule(rule));
        rules.is_empty()
    }

    pub async fn snapshot_rules(&self) -> Vec<ProxyRule> {
        self.rules.lock().await.clone()
    }

    /// Tears the listener down synchronously: cancels every background task and waits for all
    /// of them to finish (in-flight TCP connections drain their current read/write, UDP sessions
    /// are dropped).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

async fn run_tcp_ingress(
    net_stack: NetStack,
    port: u16,
    destination: Arc<StdMutex<SocketAddr>>,
    cancel: CancellationToken,
) {
    let listener = match net_stack.listen_tcp(port) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to start ingress TCP listener");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok(overlay) = accepted else { return };
                let dest = *destination.lock().expect("lock poisoned");
                tokio::spawn(async move {
                    match HostTcpStream::connect(dest).await {
                        Ok(host) => splice(overlay, host).await,
                        Err(e) => tracing::debug!(%dest, error = %e, "ingress dial to destination failed"),
                    }
                });
            }
        }
    }
}

async fn run_tcp_egress(
    net_stack: NetStack,
    port: u16,
    destination: Arc<StdMutex<SocketAddr>>,
    cancel: CancellationToken,
) {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match HostTcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to start egress TCP listener");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((host, _peer)) = accepted else { return };
                let dest = *destination.lock().expect("lock poisoned");
                let net_stack = net_stack.clone();
                tokio::spawn(async move {
                    match net_stack.dial_tcp(dest).await {
                        Ok(overlay) => splice(overlay, host).await,
                        Err(e) => tracing::debug!(%dest, error = %e, "egress dial to destination failed"),
                    }
                });
            }
        }
    }
}

/// Splices bytes in both directions until either side half-closes; propagates half-closes;
/// never aborts on a clean EOF, and always closes both legs on error.
async fn splice(overlay: OverlayTcpStream, host: HostTcpStream) {
    let overlay = Arc::new(overlay);
    let (mut host_rd, mut host_wr) = host.into_split();

    let to_host = {
        let overlay = overlay.clone();
        async move {
            let mut buf = vec![0u8; SPLICE_BUFFER];
            loop {
                match overlay.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if host_wr.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = host_wr.shutdown().await;
        }
    };

    let to_overlay = {
        let overlay = overlay.clone();
        async move {
            let mut buf = vec![0u8; SPLICE_BUFFER];
            loop {
                match host_rd.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if overlay.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            overlay.close();
        }
    };

    tokio::join!(to_host, to_overlay);
}

struct IngressUdpSession {
    outbound: Arc<HostUdpSocket>,
    last_active: Arc<StdMutex<Instant>>,
    recv_task: AbortHandle,
}

impl Drop for IngressUdpSession {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn run_udp_ingress(
    net_stack: NetStack,
    port: u16,
    destination: Arc<StdMutex<SocketAddr>>,
    cancel: CancellationToken,
) {
    let socket = match net_stack.bind_udp(port) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to bind ingress UDP listener");
            return;
        }
    };

    let sessions: Arc<Mutex<HashMap<SocketAddr, IngressUdpSession>>> = Arc::new(Mutex::new(HashMap::new()));
    let sweeper_sessions = sessions.clone();
    let sweeper_cancel = cancel.clone();
    tokio::spawn(async move {
        sweep_sessions(sweeper_sessions, sweeper_cancel, |s: &IngressUdpSession| s.last_active.clone()).await
    });

    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        let Ok((n, source)) = received else { continue };
        let dest = *destination.lock().expect("lock poisoned");

        let mut guard = sessions.lock().await;
        if let Some(session) = guard.get(&source) {
            *session.last_active.lock().expect("lock poisoned") = Instant::now();
            let _ = session.outbound.send(&buf[..n]).await;
        } else {
            let Ok(outbound) = bind_ephemeral_host_udp().await else { continue };
            if outbound.connect(dest).await.is_err() {
                continue;
            }
            let outbound = Arc::new(outbound);
            let last_active = Arc::new(StdMutex::new(Instant::now()));

            let reply_socket = socket.clone();
            let reply_outbound = outbound.clone();
            let reply_last_active = last_active.clone();
            let recv_task = tokio::spawn(async move {
                let mut buf = vec![0u8; UDP_BUFFER];
                loop {
                    match reply_outbound.recv(&mut buf).await {
                        Ok(n) => {
                            *reply_last_active.lock().expect("lock poisoned") = Instant::now();
                            let _ = reply_socket.send_to(&buf[..n], source);
                        }
                        Err(_) => return,
                    }
                }
            })
            .abort_handle();

            let _ = outbound.send(&buf[..n]).await;
            guard.insert(
                source,
                IngressUdpSession {
                    outbound,
                    last_active,
                    recv_task,
                },
            );
        }
    }
}

struct EgressUdpSession {
    outbound: Arc<OverlayUdpSocket>,
    last_active: Arc<StdMutex<Instant>>,
    recv_task: AbortHandle,
}

impl Drop for EgressUdpSession {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn run_udp_egress(
    net_stack: NetStack,
    port: u16,
    destination: Arc<StdMutex<SocketAddr>>,
    cancel: CancellationToken,
) {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = match HostUdpSocket::bind(bind_addr).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to bind egress UDP listener");
            return;
        }
    };

    let sessions: Arc<Mutex<HashMap<SocketAddr, EgressUdpSession>>> = Arc::new(Mutex::new(HashMap::new()));
    let sweeper_sessions = sessions.clone();
    let sweeper_cancel = cancel.clone();
    tokio::spawn(async move {
        sweep_sessions(sweeper_sessions, sweeper_cancel, |s: &EgressUdpSession| s.last_active.clone()).await
    });

    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        let Ok((n, source)) = received else { continue };
        let dest = *destination.lock().expect("lock poisoned");

        let mut guard = sessions.lock().await;
        if let Some(session) = guard.get(&source) {
            *session.last_active.lock().expect("lock poisoned") = Instant::now();
            let _ = session.outbound.send_to(&buf[..n], dest);
        } else {
            let Some(outbound) = bind_ephemeral_overlay_udp(&net_stack) else { continue };
            let outbound = Arc::new(outbound);
            let last_active = Arc::new(StdMutex::new(Instant::now()));

            let reply_socket = socket.clone();
            let reply_outbound = outbound.clone();
            let reply_last_active = last_active.clone();
            let recv_task = tokio::spawn(async move {
                let mut buf = vec![0u8; UDP_BUFFER];
                loop {
                    match reply_outbound.recv_from(&mut buf).await {
                        Ok((n, _from)) => {
                            *reply_last_active.lock().expect("lock poisoned") = Instant::now();
                            let _ = reply_socket.send_to(&buf[..n], source).await;
                        }
                        Err(_) => return,
                    }
                }
            })
            .abort_handle();

            let _ = outbound.send_to(&buf[..n], dest);
            guard.insert(
                source,
                EgressUdpSession {
                    outbound,
                    last_active,
                    recv_task,
                },
            );
        }
    }
}

async fn bind_ephemeral_host_udp() -> std::io::Result<HostUdpSocket> {
    HostUdpSocket::bind(("0.0.0.0", 0)).await
}

/// `smoltcp`'s UDP socket needs an explicit port; pick a random one in the ephemeral range and
/// retry on collision a bounded number of times.
fn bind_ephemeral_overlay_udp(net_stack: &NetStack) -> Option<OverlayUdpSocket> {
    for _ in 0..16 {
        let port = rand::thread_rng().gen_range(20000..60000);
        if let Ok(socket) = net_stack.bind_udp(port) {
            return Some(socket);
        }
    }
    None
}

async fn sweep_sessions<S>(
    sessions: Arc<Mutex<HashMap<SocketAddr, S>>>,
    cancel: CancellationToken,
    last_active_of: impl Fn(&S) -> Arc<StdMutex<Instant>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(UDP_SWEEP_INTERVAL) => {}
        }

        let mut guard = sessions.lock().await;
        guard.retain(|_, session| last_active_of(session).lock().expect("lock poisoned").elapsed() < UDP_IDLE_TIMEOUT);
    }
}
