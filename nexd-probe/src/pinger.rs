//! The actual ICMP echo transport, kept behind a trait so the batching logic in [`crate::Prober`]
//! can be tested without raw sockets or elevated privileges.
//!
//! The real implementation is grounded on the teacher's own ICMP load-testing tool
//! (`tests/loadtest::ping`), which uses `surge_ping` for cross-platform echo requests against
//! `surge_ping::Client`s shared across targets of the same address family.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};

#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    /// Sends one ICMP echo request and waits up to `timeout` for a reply. `Ok(true)` for a
    /// reply, `Ok(false)` for a timeout; `Err` only for a local failure to even send (e.g. no
    /// raw-socket permission), distinguished so the caller can fall back to "unreachable" instead
    /// of propagating an error for the whole batch.
    async fn ping(&self, addr: IpAddr, timeout: Duration) -> bool;
}

/// Real ICMP transport: one `surge_ping::Client` per address family, shared across every probe.
pub struct IcmpPinger {
    v4: Option<Client>,
    v6: Option<Client>,
    next_id: AtomicU16,
}

impl IcmpPinger {
    /// Builds clients for both families. Either may fail to construct (no `CAP_NET_RAW`, no
    /// root) without failing the whole prober: the affected family simply reports every peer as
    /// unreachable rather than erroring (spec §5: "a cancelled probe is reported as unreachable,
    /// not an error").
    pub fn new() -> Self {
        let v4 = Client::new(&Config::default())
            .inspect_err(|e| tracing::warn!(error = %e, "failed to create ICMPv4 client, v4 probes will report unreachable"))
            .ok();
        let v6 = Client::new(&Config::builder().kind(ICMP::V6).build())
            .inspect_err(|e| tracing::warn!(error = %e, "failed to create ICMPv6 client, v6 probes will report unreachable"))
            .ok();

        Self {
            v4,
            v6,
            next_id: AtomicU16::new(0),
        }
    }

    /// Best-effort check for whether raw ICMP sockets are usable at all, so the supervisor can
    /// log once at startup instead of once per peer per batch.
    pub fn has_icmp_capability() -> bool {
        if is_root() {
            return true;
        }
        caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_NET_RAW).unwrap_or(false)
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn is_root() -> bool {
    nix::unistd::Uid::current().is_root()
}

#[cfg(not(target_os = "linux"))]
fn is_root() -> bool {
    false
}

#[async_trait::async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, addr: IpAddr, timeout: Duration) -> bool {
        let client = match addr {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(client) = client else {
            return false;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pinger = client.pinger(addr, PingIdentifier(id)).await;
        pinger.timeout(timeout);

        pinger.ping(PingSequence(0), &[0xAB; 8]).await.is_ok()
    }
}

#[cfg(test)]
pub struct FakePinger {
    pub reachable: std::collections::HashSet<IpAddr>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, addr: IpAddr, _timeout: Duration) -> bool {
        self.reachable.contains(&addr)
    }
}
