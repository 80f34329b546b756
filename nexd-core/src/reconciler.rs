//! Reconciler (component F): periodically diffs the controller's device list against the
//! device cache and applies the difference to the tunnel data plane.
//!
//! State machine: `Starting -> WaitingForAuth -> Running -> (Stopping)`, mirrored in a
//! `tokio::sync::watch` so the `Status` RPC (component I) can read it without locking out the
//! reconciliation loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoffBuilder;
use nexd_dataplane::{DataPlane, PeerConfig, PublicKey};
use rand::Rng as _;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerClient;
use crate::device_cache::{DeviceCache, UpsertResult};
use crate::model::{CidrSet, DeviceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Starting,
    WaitingForAuth,
    Running,
    Stopping,
}

impl std::fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconcilerState::Starting => "Starting",
            ReconcilerState::WaitingForAuth => "WaitingForAuth",
            ReconcilerState::Running => "Running",
            ReconcilerState::Stopping => "Stopping",
        };
        f.write_str(s)
    }
}

/// Local policy that does not come from the controller.
#[derive(Debug, Clone)]
pub struct Policy {
    pub relay_only: bool,
    pub persistent_keepalive: Option<Duration>,
}

pub struct ReconcilerConfig {
    pub local_public_key: PublicKey,
    pub local_endpoint: Option<SocketAddr>,
    pub organization_cidrs: CidrSet,
    pub host_owned_routes: CidrSet,
    pub policy: Policy,
    pub interval: Duration,
    pub username: String,
    pub password: String,
}

pub struct Reconciler {
    controller: Arc<ControllerClient>,
    cache: Arc<DeviceCache>,
    data_plane: Arc<dyn DataPlane>,
    config: ReconcilerConfig,
    state_tx: watch::Sender<ReconcilerState>,
    auth_detail: Arc<std::sync::RwLock<Option<String>>>,
}

impl Reconciler {
    pub fn new(
        controller: Arc<ControllerClient>,
        cache: Arc<DeviceCache>,
        data_plane: Arc<dyn DataPlane>,
        config: ReconcilerConfig,
        auth_detail: Arc<std::sync::RwLock<Option<String>>>,
    ) -> (Self, watch::Receiver<ReconcilerState>) {
        let (state_tx, state_rx) = watch::channel(ReconcilerState::Starting);
        (
            Self {
                controller,
                cache,
                data_plane,
                config,
                state_tx,
                auth_detail,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: ReconcilerState) {
        tracing::debug!(?state, "reconciler state transition");
        let _ = self.state_tx.send(state);
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state_tx.borrow()
    }

    /// Runs the periodic reconciliation loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        self.set_state(ReconcilerState::Starting);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.controller.list_devices().await {
                Ok(devices) => {
                    if self.state() == ReconcilerState::WaitingForAuth || self.state() == ReconcilerState::Starting {
                        *self.auth_detail.write().expect("lock poisoned") = None;
                        self.set_state(ReconcilerState::Running);
                    }
                    self.reconcile_once(devices).await;
                }
                Err(e) if e.is_authentication() => {
                    self.set_state(ReconcilerState::WaitingForAuth);
                    self.wait_for_auth(&cancel).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transient failure listing devices, retrying next pass");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(self.config.interval)) => {}
            }
        }

        self.set_state(ReconcilerState::Stopping);
    }

    /// Retries login with capped exponential backoff until it succeeds or cancellation fires.
    async fn wait_for_auth(&self, cancel: &CancellationToken) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.controller.login(&self.config.username, &self.config.password).await {
                Ok(()) => {
                    *self.auth_detail.write().expect("lock poisoned") = None;
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    *self.auth_detail.write().expect("lock poisoned") = Some(e.to_string());
                    tracing::warn!(error = %e, delay = ?delay, "authentication failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One reconciliation pass: diff, then apply deletes before adds (spec §5: "a peer that
    /// changed public key does not briefly collide").
    async fn reconcile_once(&self, devices: Vec<(PublicKey, DeviceRecord)>) {
        let desired = self.build_desired_set(devices);
        let current_keys: Vec<PublicKey> = self.cache.keys().await;

        let deleted: Vec<PublicKey> = current_keys
            .into_iter()
            .filter(|k| !desired.contains_key(k))
            .collect();

        for key in deleted {
            tracing::info!(public_key = %nexd_dataplane::encode_public_key(&key), "removing peer");
            if let Err(e) = self.data_plane.remove_peer(&key) {
                tracing::warn!(error = %e, "failed to remove peer from data plane");
            }
            self.cache.delete(&key).await;
        }

        let installed = self.data_plane.get_peer_stats();

        for (key, record) in desired {
            let classification = self.cache.upsert(key, record.clone()).await;
            // An `Unchanged` classification only tells us the cache didn't need to move; it says
            // nothing about the data plane, which may have just been freshly `init`'d (restart,
            // primed from a cached snapshot) and not yet hold this peer at all. Spec §3: every
            // cache entry must have a matching data-plane peer "up to the current reconciliation
            // epoch" — so an unchanged peer still needs `set_peer` the first time it's missing.
            if classification == UpsertResult::Unchanged && installed.contains_key(&key) {
                continue;
            }

            self.apply_peer(key, &record).await;
            self.cache.mark_reconciled(&key, std::time::SystemTime::now()).await;
        }
    }

    /// Builds the desired set, keyed by public key, omitting the local device and defensively
    /// resolving same-key collisions (spec §4.F: "the most recently updated wins").
    fn build_desired_set(&self, devices: Vec<(PublicKey, DeviceRecord)>) -> HashMap<PublicKey, DeviceRecord> {
        let mut desired = HashMap::new();

        for (key, record) in devices {
            if key == self.config.local_public_key {
                continue;
            }

            if let Some(previous) = desired.insert(key, record) {
                tracing::warn!(
                    public_key = %nexd_dataplane::encode_public_key(&key),
                    dropped_device_id = %previous.device_id,
                    "duplicate public key in controller response, keeping most recent"
                );
            }
        }

        desired
    }

    async fn apply_peer(&self, key: PublicKey, record: &DeviceRecord) {
        if let Some(local) = self.config.local_endpoint {
            if record.preferred_endpoint() == Some(local) {
                tracing::warn!(device_id = %record.device_id, "peer endpoint resolves to local address, skipping to avoid self-loop");
                return;
            }
        }

        let relay_peer = record.relay;
        let skip_direct = (record.symmetric_nat || self.config.policy.relay_only) && !relay_peer;
        if skip_direct {
            tracing::debug!(device_id = %record.device_id, "peer behind symmetric NAT or relay-only policy, routing via relay");
            return;
        }

        let allowed_ips = if relay_peer {
            self.config.organization_cidrs.clone()
        } else {
            record.allowed_ips.clone()
        };

        if allowed_ips.contains_overlap(&self.config.host_owned_routes) {
            tracing::warn!(device_id = %record.device_id, "allowed-ips overlap a host-owned route, skipping peer");
            return;
        }

        let peer = PeerConfig {
            public_key: key,
            endpoint: record.preferred_endpoint(),
            allowed_ips: allowed_ips.iter().copied().collect(),
            persistent_keepalive: self.config.policy.persistent_keepalive,
        };

        if let Err(e) = self.data_plane.set_peer(&peer) {
            tracing::warn!(device_id = %record.device_id, error = %e, "failed to program peer, will retry next pass");
        }
    }
}

/// Jitters an interval by up to +/-20% so many agents polling the same controller don't
/// synchronise their reconciliation passes.
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as i64 / 5;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = (base.as_millis() as i64 + offset).max(0) as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexd_dataplane::userspace::UserspaceDataPlane;

    fn base_config(local_key: PublicKey) -> ReconcilerConfig {
        ReconcilerConfig {
            local_public_key: local_key,
            local_endpoint: None,
            organization_cidrs: CidrSet::default(),
            host_owned_routes: CidrSet::default(),
            policy: Policy {
                relay_only: false,
                persistent_keepalive: None,
            },
            interval: Duration::from_secs(5),
            username: "user".into(),
            password: "pass".into(),
        }
    }

    fn no_auth_detail() -> Arc<std::sync::RwLock<Option<String>>> {
        Arc::new(std::sync::RwLock::new(None))
    }

    fn record(device_id: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: device_id.into(),
            organization_id: "org".into(),
            hostname: device_id.into(),
            overlay_ipv4: Some("100.64.0.2".parse().unwrap()),
            overlay_ipv6: None,
            local_endpoint: Some("203.0.113.9:51820".parse().unwrap()),
            reflexive_ipv4: None,
            symmetric_nat: false,
            relay: false,
            child_prefixes: CidrSet::default(),
            allowed_ips: CidrSet::new(vec!["100.64.0.2/32".parse().unwrap()]),
        }
    }

    #[tokio::test]
    async fn delete_before_add_on_public_key_change() {
        let cache = Arc::new(DeviceCache::new());
        let data_plane: Arc<dyn DataPlane> = Arc::new(UserspaceDataPlane::new());
        data_plane
            .init(&x25519_dalek::StaticSecret::from([1u8; 32]), 0, None, None)
            .unwrap();

        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        cache.upsert(k1, record("p")).await;

        let controller = Arc::new(ControllerClient::new("https://example.invalid".parse().unwrap(), false).unwrap());
        let (reconciler, _rx) = Reconciler::new(controller, cache.clone(), data_plane, base_config([0u8; 32]), no_auth_detail());

        reconciler.reconcile_once(vec![(k2, record("p"))]).await;

        assert!(cache.get(&k1).await.is_none());
        assert!(cache.get(&k2).await.is_some());
    }

    #[tokio::test]
    async fn reconcile_against_empty_list_removes_all_peers() {
        let cache = Arc::new(DeviceCache::new());
        let data_plane: Arc<dyn DataPlane> = Arc::new(UserspaceDataPlane::new());
        data_plane
            .init(&x25519_dalek::StaticSecret::from([1u8; 32]), 0, None, None)
            .unwrap();

        cache.upsert([1u8; 32], record("p1")).await;
        cache.upsert([2u8; 32], record("p2")).await;

        let controller = Arc::new(ControllerClient::new("https://example.invalid".parse().unwrap(), false).unwrap());
        let (reconciler, _rx) = Reconciler::new(controller, cache.clone(), data_plane, base_config([0u8; 32]), no_auth_detail());

        reconciler.reconcile_once(vec![]).await;

        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn local_device_omitted_from_desired_set() {
        let cache = Arc::new(DeviceCache::new());
        let data_plane: Arc<dyn DataPlane> = Arc::new(UserspaceDataPlane::new());
        data_plane
            .init(&x25519_dalek::StaticSecret::from([1u8; 32]), 0, None, None)
            .unwrap();

        let local = [9u8; 32];
        let controller = Arc::new(ControllerClient::new("https://example.invalid".parse().unwrap(), false).unwrap());
        let (reconciler, _rx) = Reconciler::new(controller, cache.clone(), data_plane, base_config(local), no_auth_detail());

        reconciler.reconcile_once(vec![(local, record("self"))]).await;

        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn unchanged_peer_missing_from_data_plane_is_still_programmed() {
        // Simulates a restart: the cache was primed from `device_snapshot.json` before the data
        // plane was (re-)initialised, so the cache already holds a record identical to what the
        // controller reports, but the freshly-init'd data plane has never seen this peer.
        let cache = Arc::new(DeviceCache::new());
        let data_plane: Arc<dyn DataPlane> = Arc::new(UserspaceDataPlane::new());
        data_plane
            .init(&x25519_dalek::StaticSecret::from([1u8; 32]), 0, None, None)
            .unwrap();

        let k = [1u8; 32];
        cache.upsert(k, record("p")).await;
        assert!(data_plane.get_peer_stats().is_empty());

        let controller = Arc::new(ControllerClient::new("https://example.invalid".parse().unwrap(), false).unwrap());
        let (reconciler, _rx) = Reconciler::new(controller, cache.clone(), data_plane.clone(), base_config([0u8; 32]), no_auth_detail());

        reconciler.reconcile_once(vec![(k, record("p"))]).await;

        assert!(data_plane.get_peer_stats().contains_key(&k));
    }

    #[test]
    fn duplicate_public_key_keeps_last_and_warns() {
        let config = base_config([0u8; 32]);
        let cache = Arc::new(DeviceCache::new());
        let data_plane: Arc<dyn DataPlane> = Arc::new(UserspaceDataPlane::new());
        let controller = Arc::new(ControllerClient::new("https://example.invalid".parse().unwrap(), false).unwrap());
        let (reconciler, _rx) = Reconciler::new(controller, cache, data_plane, config, no_auth_detail());

        let k = [3u8; 32];
        let desired = reconciler.build_desired_set(vec![(k, record("first")), (k, record("second"))]);

        assert_eq!(desired.get(&k).unwrap().device_id, "second");
    }
}
