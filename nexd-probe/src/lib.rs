//! Connectivity prober (component H): a bounded-parallelism ICMP reachability sweep over the
//! device cache's peer set.
//!
//! Peers are processed in batches of ten (spec §4.H): each batch launches one concurrent ICMP
//! echo per peer and waits for every reply (or per-probe timeout) before the next batch starts.
//! This caps simultaneous raw-socket use and avoids bursting on large peer sets — the
//! parallel-batch primitive spec §9 calls out as the idiomatic expression of the original's
//! coroutine fan-out.

pub mod pinger;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use nexd_core::DeviceCache;
use nexd_core::model::KeepaliveStatus;

pub use pinger::{IcmpPinger, Pinger};

const BATCH_SIZE: usize = 10;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

pub struct Prober<P: Pinger> {
    cache: Arc<DeviceCache>,
    pinger: P,
    timeout: Duration,
}

impl<P: Pinger> Prober<P> {
    pub fn new(cache: Arc<DeviceCache>, pinger: P) -> Self {
        Self {
            cache,
            pinger,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probes every peer carrying a parseable overlay address for `family`. Relays never probe
    /// (spec §4.H: "when the local node is the relay, excluding all peers"); an empty candidate
    /// set returns an empty map, not an error.
    pub async fn probe(&self, family: Family, local_is_relay: bool) -> BTreeMap<IpAddr, KeepaliveStatus> {
        let mut results = BTreeMap::new();

        if local_is_relay {
            return results;
        }

        let candidates = self.candidates(family).await;

        for batch in candidates.chunks(BATCH_SIZE) {
            let replies = futures::future::join_all(batch.iter().map(|(addr, hostname)| {
                let addr = *addr;
                let hostname = hostname.clone();
                async move {
                    let reachable = self.pinger.ping(addr, self.timeout).await;
                    (
                        addr,
                        KeepaliveStatus {
                            overlay_ip: addr,
                            hostname,
                            reachable,
                        },
                    )
                }
            }))
            .await;

            results.extend(replies);
        }

        results
    }

    /// `(overlay address, hostname)` for every cache entry carrying a parseable address for
    /// `family`. Entries lacking one are omitted entirely, not reported as unreachable (spec §8).
    async fn candidates(&self, family: Family) -> Vec<(IpAddr, String)> {
        let mut out = Vec::new();
        self.cache
            .iterate_read(|_key, entry| {
                let addr = match family {
                    Family::V4 => entry.record.overlay_ipv4,
                    Family::V6 => entry.record.overlay_ipv6,
                };
                if let Some(addr) = addr {
                    out.push((addr, entry.record.hostname.clone()));
                }
            })
            .await;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexd_core::model::{CidrSet, DeviceRecord};
    use pinger::FakePinger;
    use std::collections::HashSet;

    fn record(n: u8, hostname: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: format!("dev-{n}"),
            organization_id: "org".into(),
            hostname: hostname.into(),
            overlay_ipv4: Some(IpAddr::V4(std::net::Ipv4Addr::new(100, 64, 0, n))),
            overlay_ipv6: None,
            local_endpoint: None,
            reflexive_ipv4: None,
            symmetric_nat: false,
            relay: false,
            child_prefixes: CidrSet::default(),
            allowed_ips: CidrSet::default(),
        }
    }

    #[tokio::test]
    async fn empty_peer_set_returns_empty_map() {
        let cache = Arc::new(DeviceCache::new());
        let prober = Prober::new(cache, FakePinger { reachable: HashSet::new() });

        let result = prober.probe(Family::V4, false).await;

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn relay_node_never_probes() {
        let cache = Arc::new(DeviceCache::new());
        cache.upsert([1u8; 32], record(2, "host-a")).await;

        let reachable: HashSet<IpAddr> = [IpAddr::V4(std::net::Ipv4Addr::new(100, 64, 0, 2))].into();
        let prober = Prober::new(cache, FakePinger { reachable });

        let result = prober.probe(Family::V4, true).await;

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn peer_without_parseable_address_is_omitted_not_unreachable() {
        let cache = Arc::new(DeviceCache::new());
        cache.upsert([1u8; 32], record(2, "host-a")).await; // no v6 address

        let prober = Prober::new(cache, FakePinger { reachable: HashSet::new() });

        let result = prober.probe(Family::V6, false).await;

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn batches_of_ten_cover_twenty_five_peers() {
        let cache = Arc::new(DeviceCache::new());
        for n in 1..=25u8 {
            cache.upsert([n; 32], record(n, &format!("host-{n}"))).await;
        }

        let prober = Prober::new(cache, FakePinger { reachable: HashSet::new() });
        let result = prober.probe(Family::V4, false).await;

        assert_eq!(result.len(), 25);
        assert!(result.values().all(|status| !status.reachable));
    }

    #[tokio::test]
    async fn reachable_peers_are_marked_true() {
        let cache = Arc::new(DeviceCache::new());
        cache.upsert([1u8; 32], record(2, "host-a")).await;
        cache.upsert([2u8; 32], record(3, "host-b")).await;

        let reachable: HashSet<IpAddr> = [IpAddr::V4(std::net::Ipv4Addr::new(100, 64, 0, 2))].into();
        let prober = Prober::new(cache, FakePinger { reachable });

        let result = prober.probe(Family::V4, false).await;

        assert!(result[&IpAddr::V4(std::net::Ipv4Addr::new(100, 64, 0, 2))].reachable);
        assert!(!result[&IpAddr::V4(std::net::Ipv4Addr::new(100, 64, 0, 3))].reachable);
    }
}
