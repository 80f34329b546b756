//! Device cache (component D): the in-memory public-key → device record mapping kept consistent
//! with the controller, under a single reader-writer discipline (spec §5: "visitors under read
//! hold must be short and non-blocking").

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use nexd_dataplane::{PublicKey, decode_public_key, encode_public_key};
use tokio::sync::RwLock;

use crate::model::DeviceRecord;

const SNAPSHOT_FILE: &str = "device_snapshot.json";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: DeviceRecord,
    pub peer_healthy: bool,
    pub last_reconciled: Option<SystemTime>,
    pub last_handshake: Option<SystemTime>,
}

impl CacheEntry {
    fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            peer_healthy: false,
            last_reconciled: None,
            last_handshake: None,
        }
    }
}

/// Classification returned by [`DeviceCache::upsert`], driving whether the reconciler touches
/// the data plane at all for this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Added,
    Updated,
    Unchanged,
}

#[derive(Default)]
pub struct DeviceCache {
    entries: RwLock<HashMap<PublicKey, CacheEntry>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the current entries. Safe to hold onto; it is a snapshot, not a live view.
    pub async fn snapshot(&self) -> HashMap<PublicKey, CacheEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, public_key: &PublicKey) -> Option<CacheEntry> {
        self.entries.read().await.get(public_key).cloned()
    }

    /// Invokes `visitor` once per entry under a single read hold. The visitor must not block or
    /// await — it runs while the read lock is held.
    pub async fn iterate_read(&self, mut visitor: impl FnMut(&PublicKey, &CacheEntry)) {
        let guard = self.entries.read().await;
        for (key, entry) in guard.iter() {
            visitor(key, entry);
        }
    }

    /// Replaces or inserts a device record, returning a field-wise classification. CIDR lists
    /// compare as sets and addresses compare after canonicalisation (both handled by
    /// `DeviceRecord`'s own `PartialEq`, since `CidrSet`'s equality is already set-based and
    /// `DeviceRecord`'s fields are built from canonicalised addresses at controller-parse time).
    pub async fn upsert(&self, public_key: PublicKey, record: DeviceRecord) -> UpsertResult {
        let mut guard = self.entries.write().await;

        match guard.get_mut(&public_key) {
            None => {
                guard.insert(public_key, CacheEntry::new(record));
                UpsertResult::Added
            }
            Some(existing) if existing.record == record => UpsertResult::Unchanged,
            Some(existing) => {
                existing.record = record;
                UpsertResult::Updated
            }
        }
    }

    pub async fn delete(&self, public_key: &PublicKey) -> Option<CacheEntry> {
        self.entries.write().await.remove(public_key)
    }

    pub async fn set_healthy(&self, public_key: &PublicKey, healthy: bool) {
        if let Some(entry) = self.entries.write().await.get_mut(public_key) {
            entry.peer_healthy = healthy;
        }
    }

    pub async fn set_last_handshake(&self, public_key: &PublicKey, at: SystemTime) {
        if let Some(entry) = self.entries.write().await.get_mut(public_key) {
            entry.last_handshake = Some(at);
        }
    }

    pub async fn mark_reconciled(&self, public_key: &PublicKey, at: SystemTime) {
        if let Some(entry) = self.entries.write().await.get_mut(public_key) {
            entry.last_reconciled = Some(at);
        }
    }

    pub async fn keys(&self) -> Vec<PublicKey> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Writes the current records (not health/handshake state, which is meaningless across a
    /// restart) to `<state_dir>/device_snapshot.json` for faster cold start next time.
    pub async fn persist_snapshot(&self, state_dir: &Path) -> anyhow::Result<()> {
        let guard = self.entries.read().await;
        let records: HashMap<String, DeviceRecord> = guard
            .iter()
            .map(|(key, entry)| (encode_public_key(key), entry.record.clone()))
            .collect();
        drop(guard);

        let path = state_dir.join(SNAPSHOT_FILE);
        let json = serde_json::to_string(&records)?;

        let file = atomicwrites::AtomicFile::new(&path, atomicwrites::OverwriteBehavior::AllowOverwrite);
        file.write(|f| std::io::Write::write_all(f, json.as_bytes()))?;
        Ok(())
    }

    /// Primes the cache from a snapshot left by a previous run, if one exists. Entries load with
    /// `peer_healthy = false` and no handshake time: the reconciler and prober re-establish those
    /// on their first pass. A missing or unreadable snapshot is not an error (spec §6: "optional").
    pub async fn load_snapshot(&self, state_dir: &Path) {
        let path = state_dir.join(SNAPSHOT_FILE);
        let Ok(json) = std::fs::read_to_string(&path) else {
            return;
        };
        let Ok(records) = serde_json::from_str::<HashMap<String, DeviceRecord>>(&json) else {
            tracing::warn!(path = %path.display(), "ignoring unreadable device snapshot");
            return;
        };

        let mut guard = self.entries.write().await;
        for (encoded, record) in records {
            let Ok(key) = decode_public_key(&encoded) else {
                continue;
            };
            guard.insert(key, CacheEntry::new(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CidrSet;

    fn key(byte: u8) -> PublicKey {
        [byte; 32]
    }

    fn record(hostname: &str, child_prefixes: Vec<ip_network::IpNetwork>) -> DeviceRecord {
        DeviceRecord {
            device_id: "dev-1".into(),
            organization_id: "org-1".into(),
            hostname: hostname.into(),
            overlay_ipv4: Some("100.64.0.2".parse().unwrap()),
            overlay_ipv6: None,
            local_endpoint: None,
            reflexive_ipv4: None,
            symmetric_nat: false,
            relay: false,
            child_prefixes: CidrSet::new(child_prefixes),
            allowed_ips: CidrSet::new(vec!["100.64.0.2/32".parse().unwrap()]),
        }
    }

    #[tokio::test]
    async fn upsert_classifies_added_updated_unchanged() {
        let cache = DeviceCache::new();
        let k = key(1);

        assert_eq!(cache.upsert(k, record("alice", vec![])).await, UpsertResult::Added);
        assert_eq!(cache.upsert(k, record("alice", vec![])).await, UpsertResult::Unchanged);
        assert_eq!(cache.upsert(k, record("alice-renamed", vec![])).await, UpsertResult::Updated);
    }

    #[tokio::test]
    async fn child_prefix_set_equality_is_order_insensitive() {
        let cache = DeviceCache::new();
        let k = key(2);

        let a: ip_network::IpNetwork = "192.168.1.0/24".parse().unwrap();
        let b: ip_network::IpNetwork = "2001:db8::/32".parse().unwrap();

        cache.upsert(k, record("host", vec![a, b])).await;
        let result = cache.upsert(k, record("host", vec![b, a])).await;

        assert_eq!(result, UpsertResult::Unchanged);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = DeviceCache::new();
        let k = key(3);
        cache.upsert(k, record("host", vec![])).await;

        assert!(cache.delete(&k).await.is_some());
        assert!(cache.get(&k).await.is_none());
    }
}
