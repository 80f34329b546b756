//! Async listen/dial surface over the in-process `smoltcp` interface, for `nexd-proxy` to use
//! exactly like it would use real host sockets — the proxy layer does not know or care that
//! there is no kernel routing involved on this side.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint};
use tokio::sync::Notify;
use tokio::time::sleep;

use super::device::InMemoryDevice;
use crate::DataPlaneError;

const TCP_BUFFER: usize = 64 * 1024;
const UDP_BUFFER_PACKETS: usize = 64;
const UDP_BUFFER_BYTES: usize = 64 * 1024;

fn ephemeral_local_port() -> u16 {
    rand::Rng::gen_range(&mut rand::thread_rng(), 49152..=65535)
}

struct Shared {
    device: InMemoryDevice,
    interface: Interface,
    sockets: SocketSet<'static>,
}

/// Owns the `smoltcp` state machine. Cloned handles share one interface; only the driver task
/// in `userspace.rs` ever calls `poll`.
#[derive(Clone)]
pub struct NetStack {
    inner: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    start: std::time::Instant,
}

impl NetStack {
    pub fn new(addresses: Vec<IpCidr>) -> Self {
        let mut device = InMemoryDevice::new();
        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();

        let mut interface = Interface::new(config, &mut device, SmolInstant::from_millis(0));
        interface.update_ip_addrs(|addrs| {
            for cidr in addresses {
                let _ = addrs.push(cidr);
            }
        });

        Self {
            inner: Arc::new(Mutex::new(Shared {
                device,
                interface,
                sockets: SocketSet::new(vec![]),
            })),
            notify: Arc::new(Notify::new()),
            start: std::time::Instant::now(),
        }
    }

    fn now(&self) -> SmolInstant {
        SmolInstant::from_millis(self.start.elapsed().as_millis() as i64)
    }

    /// Queues a decrypted packet arriving from a peer for the interface to process on its next
    /// poll. Called by the driver task after `Tunn::decapsulate`.
    pub fn inject_inbound(&self, packet: Vec<u8>) {
        let mut guard = self.inner.lock().expect("lock poisoned");
        guard.device.inject(packet);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Drains one packet the interface wants transmitted, for the driver task to encrypt and
    /// send to the owning peer.
    pub fn drain_outbound(&self) -> Option<Vec<u8>> {
        self.inner.lock().expect("lock poisoned").device.drain()
    }

    /// Runs one poll iteration; the driver task calls this in a loop alongside socket I/O.
    pub fn poll(&self) {
        let mut guard = self.inner.lock().expect("lock poisoned");
        let now = self.now();
        let Shared { device, interface, sockets } = &mut *guard;
        interface.poll(now, device, sockets);
        drop(guard);
        self.notify.notify_waiters();
    }

    async fn wait_for_change(&self) {
        // Bounded wait: the driver task notifies after every poll, but we also want to notice
        // our own freshly-queued inbound packets even if the driver is momentarily idle.
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = sleep(Duration::from_millis(20)) => {}
        }
    }

    pub fn listen_tcp(&self, port: u16) -> Result<OverlayTcpListener, DataPlaneError> {
        let socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
        );
        let handle = self.inner.lock().expect("lock poisoned").sockets.add(socket);

        {
            let mut guard = self.inner.lock().expect("lock poisoned");
            let socket = guard.sockets.get_mut::<tcp::Socket>(handle);
            socket
                .listen(port)
                .map_err(|e| DataPlaneError::InterfaceCreate(format!("listen: {e:?}")))?;
        }

        Ok(OverlayTcpListener {
            stack: self.clone(),
            handle,
            port,
        })
    }

    pub async fn dial_tcp(&self, addr: SocketAddr) -> Result<OverlayTcpStream, DataPlaneError> {
        let socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
        );
        let handle = self.inner.lock().expect("lock poisoned").sockets.add(socket);

        let endpoint = IpEndpoint::new(IpAddress::from(addr.ip()), addr.port());
        {
            let mut guard = self.inner.lock().expect("lock poisoned");
            let cx = guard.interface.context();
            let socket = guard.sockets.get_mut::<tcp::Socket>(handle);
            // `smoltcp` needs an explicit local port for `connect`; pick one in the ephemeral
            // range the same way `bind_ephemeral_overlay_udp` does for UDP sessions.
            socket
                .connect(cx, endpoint, ephemeral_local_port())
                .map_err(|e| DataPlaneError::InterfaceCreate(format!("connect: {e:?}")))?;
        }

        loop {
            {
                let mut guard = self.inner.lock().expect("lock poisoned");
                let socket = guard.sockets.get_mut::<tcp::Socket>(handle);
                if socket.may_send() {
                    break;
                }
                if !socket.is_open() {
                    return Err(DataPlaneError::InterfaceCreate(
                        "connection reset before established".into(),
                    ));
                }
            }
            self.wait_for_change().await;
        }

        Ok(OverlayTcpStream {
            stack: self.clone(),
            handle,
        })
    }

    pub fn bind_udp(&self, port: u16) -> Result<OverlayUdpSocket, DataPlaneError> {
        let socket = udp::Socket::new(
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_BUFFER_PACKETS],
                vec![0; UDP_BUFFER_BYTES],
            ),
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_BUFFER_PACKETS],
                vec![0; UDP_BUFFER_BYTES],
            ),
        );
        let handle = self.inner.lock().expect("lock poisoned").sockets.add(socket);
        {
            let mut guard = self.inner.lock().expect("lock poisoned");
            let socket = guard.sockets.get_mut::<udp::Socket>(handle);
            socket
                .bind(port)
                .map_err(|e| DataPlaneError::InterfaceCreate(format!("udp bind: {e:?}")))?;
        }

        Ok(OverlayUdpSocket {
            stack: self.clone(),
            handle,
        })
    }
}

pub struct OverlayTcpListener {
    stack: NetStack,
    handle: SocketHandle,
    port: u16,
}

impl OverlayTcpListener {
    pub async fn accept(&self) -> Result<OverlayTcpStream, DataPlaneError> {
        loop {
            {
                let mut guard = self.stack.inner.lock().expect("lock poisoned");
                let socket = guard.sockets.get_mut::<tcp::Socket>(self.handle);
                if socket.is_active() && socket.may_send() {
                    let accepted = self.handle;
                    // Rearm a fresh listener for the next connection.
                    let fresh = tcp::Socket::new(
                        tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
                        tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
                    );
                    let new_handle = guard.sockets.add(fresh);
                    guard
                        .sockets
                        .get_mut::<tcp::Socket>(new_handle)
                        .listen(self.port)
                        .map_err(|e| DataPlaneError::InterfaceCreate(format!("relisten: {e:?}")))?;
                    drop(guard);
                    return Ok(OverlayTcpStream {
                        stack: self.stack.clone(),
                        handle: accepted,
                    });
                }
            }
            self.stack.wait_for_change().await;
        }
    }
}

pub struct OverlayTcpStream {
    stack: NetStack,
    handle: SocketHandle,
}

impl OverlayTcpStream {
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, DataPlaneError> {
        loop {
            {
                let mut guard = self.stack.inner.lock().expect("lock poisoned");
                let socket = guard.sockets.get_mut::<tcp::Socket>(self.handle);
                if socket.can_recv() {
                    let n = socket
                        .recv_slice(buf)
                        .map_err(|e| DataPlaneError::InterfaceCreate(format!("recv: {e:?}")))?;
                    return Ok(n);
                }
                if !socket.may_recv() {
                    return Ok(0); // clean half-close, not an error
                }
            }
            self.stack.wait_for_change().await;
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, DataPlaneError> {
        loop {
            {
                let mut guard = self.stack.inner.lock().expect("lock poisoned");
                let socket = guard.sockets.get_mut::<tcp::Socket>(self.handle);
                if socket.can_send() {
                    let n = socket
                        .send_slice(buf)
                        .map_err(|e| DataPlaneError::InterfaceCreate(format!("send: {e:?}")))?;
                    return Ok(n);
                }
                if !socket.is_open() {
                    return Err(DataPlaneError::InterfaceCreate("socket closed".into()));
                }
            }
            self.stack.wait_for_change().await;
        }
    }

    pub fn close(&self) {
        let mut guard = self.stack.inner.lock().expect("lock poisoned");
        guard.sockets.get_mut::<tcp::Socket>(self.handle).close();
    }
}

pub struct OverlayUdpSocket {
    stack: NetStack,
    handle: SocketHandle,
}

impl OverlayUdpSocket {
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DataPlaneError> {
        loop {
            {
                let mut guard = self.stack.inner.lock().expect("lock poisoned");
                let socket = guard.sockets.get_mut::<udp::Socket>(self.handle);
                if socket.can_recv() {
                    let (n, meta) = socket
                        .recv_slice(buf)
                        .map_err(|e| DataPlaneError::InterfaceCreate(format!("udp recv: {e:?}")))?;
                    let addr = SocketAddr::new(meta.endpoint.addr.into(), meta.endpoint.port);
                    return Ok((n, addr));
                }
            }
            self.stack.wait_for_change().await;
        }
    }

    pub fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<(), DataPlaneError> {
        let mut guard = self.stack.inner.lock().expect("lock poisoned");
        let socket = guard.sockets.get_mut::<udp::Socket>(self.handle);
        let endpoint = IpEndpoint::new(IpAddress::from(to.ip()), to.port());
        socket
            .send_slice(buf, endpoint)
            .map_err(|e| DataPlaneError::InterfaceCreate(format!("udp send: {e:?}")))
    }
}
