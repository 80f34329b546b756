//! Userspace L4 proxy (component G): a rule-indexed forwarder multiplexing TCP accept/dial and
//! UDP session tables between the in-process overlay network stack and the host OS, in both
//! ingress and egress directions.
//!
//! Rules are uniquely indexed by `(type, protocol, listen_port)` (spec §3): one [`Listener`] per
//! triple, shared by every rule registered on it. The outer lock here is the listener set; each
//! `Listener` holds its own inner lock over its rule slice and UDP session map (spec §5).

mod error;
mod listener;
mod persistence;
pub mod rule;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nexd_dataplane::userspace::netstack::NetStack;
use tokio::sync::RwLock;

pub use error::ProxyError;
pub use rule::{Direction, ListenerKey, Protocol, ProxyRule, RuleParseError};

use listener::Listener;

pub struct ProxyManager {
    net_stack: NetStack,
    state_dir: PathBuf,
    listeners: RwLock<HashMap<ListenerKey, Arc<Listener>>>,
}

impl ProxyManager {
    pub fn new(net_stack: NetStack, state_dir: PathBuf) -> Self {
        Self {
            net_stack,
            state_dir,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Replays the persisted rule file rule-by-rule. Called once at startup, before the
    /// reconciler enters `Running` (spec §4.G).
    pub async fn replay_persisted(&self) -> anyhow::Result<()> {
        let rules = persistence::load(&self.state_dir)?;
        for rule in rules {
            if let Err(e) = self.add_rule(rule.clone()).await {
                tracing::warn!(rule = %rule.canonical(), error = %e, "failed to replay persisted proxy rule");
            }
        }
        Ok(())
    }

    /// Parses and adds a rule. The listener is fully armed before this returns (spec §5).
    pub async fn add(&self, direction: Direction, raw: &str, stored: bool) -> Result<ProxyRule, ProxyError> {
        let rule = ProxyRule::parse(direction, raw, stored)?;
        self.add_rule(rule.clone()).await?;
        Ok(rule)
    }

    async fn add_rule(&self, rule: ProxyRule) -> Result<(), ProxyError> {
        let key = rule.listener_key();
        let mut listeners = self.listeners.write().await;

        match listeners.get(&key) {
            Some(listener) => {
                listener.add_rule(rule.clone()).await;
            }
            None => {
                let listener = Listener::start(key, rule.clone(), self.net_stack.clone()).await;
                listeners.insert(key, listener);
            }
        }
        drop(listeners);

        if rule.stored {
            self.rewrite_persisted().await?;
        }

        Ok(())
    }

    /// Deregisters a rule; if its listener becomes empty, stops it (draining in-flight TCP
    /// connections, terminating UDP sessions) before returning — synchronous from this caller's
    /// perspective (spec §5).
    pub async fn remove(&self, direction: Direction, raw: &str) -> Result<(), ProxyError> {
        let rule = ProxyRule::parse(direction, raw, false)?;
        let key = rule.listener_key();

        let mut listeners = self.listeners.write().await;
        let Some(listener) = listeners.get(&key).cloned() else {
            return Err(ProxyError::NotFound);
        };

        let was_stored = listener
            .snapshot_rules()
            .await
            .iter()
            .any(|r| r.same_rule(&rule) && r.stored);

        let now_empty = listener.remove_rule(&rule).await;
        if now_empty {
            listener.stop().await;
            listeners.remove(&key);
        }
        drop(listeners);

        if was_stored {
            self.rewrite_persisted().await?;
        }

        Ok(())
    }

    /// One canonical string per currently registered rule, across all listeners.
    pub async fn list(&self) -> Vec<String> {
        let listeners = self.listeners.read().await;
        let mut lines = Vec::new();
        for listener in listeners.values() {
            for rule in listener.snapshot_rules().await {
                lines.push(rule.canonical());
            }
        }
        lines.sort();
        lines
    }

    async fn rewrite_persisted(&self) -> Result<(), ProxyError> {
        let listeners = self.listeners.read().await;
        let mut all_rules = Vec::new();
        for listener in listeners.values() {
            all_rules.extend(listener.snapshot_rules().await);
        }
        drop(listeners);

        persistence::persist(&self.state_dir, &all_rules).map_err(|e| ProxyError::Persistence(e.to_string()))
    }

    /// Stops every listener. Used during supervisor shutdown.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.write().await;
        for listener in listeners.values() {
            listener.stop().await;
        }
        listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn net_stack() -> NetStack {
        NetStack::new(vec![])
    }

    #[tokio::test]
    async fn add_then_list_then_remove_round_trips() {
        let dir = tempdir().unwrap();
        let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());

        manager.add(Direction::Ingress, "tcp:7000:127.0.0.1:22", true).await.unwrap();
        assert_eq!(manager.list().await, vec!["tcp:7000:127.0.0.1:22".to_string()]);

        manager.remove(Direction::Ingress, "tcp:7000:127.0.0.1:22").await.unwrap();
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn persists_stored_rules_across_manager_instances() {
        let dir = tempdir().unwrap();
        {
            let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());
            manager.add(Direction::Egress, "udp:53:9.9.9.9:53", true).await.unwrap();
        }

        let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());
        manager.replay_persisted().await.unwrap();

        assert_eq!(manager.list().await, vec!["udp:53:9.9.9.9:53".to_string()]);
    }

    #[tokio::test]
    async fn transient_rule_is_not_replayed() {
        let dir = tempdir().unwrap();
        {
            let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());
            manager.add(Direction::Ingress, "tcp:8080:10.0.0.5:80", false).await.unwrap();
        }

        let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());
        manager.replay_persisted().await.unwrap();

        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_rule() {
        let dir = tempdir().unwrap();
        let manager = ProxyManager::new(net_stack(), dir.path().to_path_buf());

        let err = manager.add(Direction::Ingress, "udp:53::9.9.9.9", true).await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }
}
