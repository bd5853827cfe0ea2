//! The fleet registry (spec.md §4.E): the single map from agent id to live
//! connection, with a hostname secondary index for lookups by the name
//! operators actually type.
//!
//! Grounded on `iwismer-rusty-timer`'s `AppState` (`services/server/src/
//! state.rs`): an `Arc<RwLock<HashMap<...>>>` behind a small register/
//! unregister/get/snapshot surface, tested with `#[tokio::test]`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::agent_connection::{AgentConnection, SharedAgentConnection};
use crate::sanitize::sanitize_agent_id;

/// Fired after a registration or removal completes, outside the lock, so a
/// slow callback can never block a concurrent registry operation.
pub type ConnectEventCallback = Arc<dyn Fn(&SharedAgentConnection) + Send + Sync>;
pub type DisconnectEventCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Inner {
    by_agent_id: HashMap<String, SharedAgentConnection>,
    by_hostname: HashMap<String, String>,
}

/// The fleet registry. Cheaply cloneable; every clone shares the same
/// underlying map.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
    on_connect: Arc<RwLock<Vec<ConnectEventCallback>>>,
    on_disconnect: Arc<RwLock<Vec<DisconnectEventCallback>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                by_agent_id: HashMap::new(),
                by_hostname: HashMap::new(),
            })),
            on_connect: Arc::new(RwLock::new(Vec::new())),
            on_disconnect: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn on_connect(&self, callback: ConnectEventCallback) {
        self.on_connect.write().push(callback);
    }

    pub fn on_disconnect(&self, callback: DisconnectEventCallback) {
        self.on_disconnect.write().push(callback);
    }

    /// Insert or replace the connection for `agent_id`. If another agent
    /// already holds the same hostname, it is evicted first (spec.md §8
    /// invariant 4: a hostname maps to at most one live connection) and its
    /// disconnect callbacks fire before the new registration's connect
    /// callbacks do.
    pub fn register(&self, conn: SharedAgentConnection) {
        let agent_id = sanitize_agent_id(&conn.agent_id);
        let hostname = conn.hostname.clone();

        let evicted = {
            let mut inner = self.inner.write();

            let displaced_by_hostname = inner
                .by_hostname
                .get(&hostname)
                .filter(|existing| **existing != agent_id)
                .cloned();

            let displaced = if let Some(stale_agent_id) = displaced_by_hostname {
                let stale = inner.by_agent_id.remove(&stale_agent_id);
                if let Some(stale) = &stale {
                    stale.close();
                }
                stale
            } else {
                None
            };

            inner.by_hostname.insert(hostname, agent_id.clone());
            inner.by_agent_id.insert(agent_id.clone(), conn.clone());
            displaced
        };

        if let Some(evicted) = evicted {
            for cb in self.on_disconnect.read().iter() {
                cb(&evicted.agent_id, "replaced by new connection from same hostname");
            }
        }
        for cb in self.on_connect.read().iter() {
            cb(&conn);
        }
    }

    /// Remove `agent_id` if present and close its connection. No-op if the
    /// agent isn't registered, or if the id currently maps to a different
    /// connection than `expected` (stale unregister after a race, spec.md
    /// §8 invariant 4).
    pub fn unregister(&self, agent_id: &str, expected: &SharedAgentConnection) {
        let agent_id = sanitize_agent_id(agent_id);
        let removed = {
            let mut inner = self.inner.write();
            match inner.by_agent_id.get(&agent_id) {
                Some(current) if Arc::ptr_eq(current, expected) => {
                    inner.by_agent_id.remove(&agent_id);
                    if inner.by_hostname.get(&expected.hostname) == Some(&agent_id) {
                        inner.by_hostname.remove(&expected.hostname);
                    }
                    true
                }
                _ => false,
            }
        };

        if removed {
            expected.close();
            for cb in self.on_disconnect.read().iter() {
                cb(&expected.agent_id, "stream closed");
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<SharedAgentConnection> {
        let agent_id = sanitize_agent_id(agent_id);
        self.inner.read().by_agent_id.get(&agent_id).cloned()
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<SharedAgentConnection> {
        let inner = self.inner.read();
        let agent_id = inner.by_hostname.get(hostname)?;
        inner.by_agent_id.get(agent_id).cloned()
    }

    /// A point-in-time copy of every live connection. Safe to iterate
    /// without holding the registry lock.
    pub fn snapshot(&self) -> Vec<SharedAgentConnection> {
        self.inner.read().by_agent_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_agent_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_conn(agent_id: &str, hostname: &str) -> SharedAgentConnection {
        Arc::new(AgentConnection::new(
            agent_id.to_string(),
            hostname.to_string(),
            "linux".to_string(),
            "x86_64".to_string(),
            "1.0.0".to_string(),
            0,
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let registry = Registry::new();
        let conn = make_conn("agent-1", "host-1");
        registry.register(conn.clone());

        assert_eq!(registry.len(), 1);
        assert!(registry.get("agent-1").is_some());
        assert!(registry.get_by_hostname("host-1").is_some());
        assert!(registry.get("agent-missing").is_none());
    }

    #[tokio::test]
    async fn registering_same_hostname_evicts_previous_connection() {
        let registry = Registry::new();
        let first = make_conn("agent-1", "shared-host");
        let second = make_conn("agent-2", "shared-host");

        registry.register(first.clone());
        registry.register(second.clone());

        assert_eq!(registry.len(), 1);
        assert!(first.is_terminal());
        assert!(!second.is_terminal());
        assert_eq!(registry.get_by_hostname("shared-host").unwrap().agent_id, "agent-2");
        assert!(registry.get("agent-1").is_none());
    }

    #[tokio::test]
    async fn unregister_is_noop_for_stale_connection() {
        let registry = Registry::new();
        let first = make_conn("agent-1", "host-1");
        registry.register(first.clone());

        let second = make_conn("agent-1", "host-1");
        // Not the currently registered connection for agent-1 — must not
        // remove the live one.
        registry.unregister("agent-1", &second);
        assert_eq!(registry.len(), 1);
        assert!(!first.is_terminal());

        registry.unregister("agent-1", &first);
        assert_eq!(registry.len(), 0);
        assert!(first.is_terminal());
    }

    #[tokio::test]
    async fn callbacks_fire_outside_the_lock() {
        let registry = Registry::new();
        let connected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let connected2 = connected.clone();
        registry.on_connect(Arc::new(move |conn| {
            connected2.lock().push(conn.agent_id.clone());
        }));

        let disconnected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let disconnected2 = disconnected.clone();
        registry.on_disconnect(Arc::new(move |agent_id, _reason| {
            disconnected2.lock().push(agent_id.to_string());
        }));

        let conn = make_conn("agent-1", "host-1");
        registry.register(conn.clone());
        registry.unregister("agent-1", &conn);

        assert_eq!(*connected.lock(), vec!["agent-1".to_string()]);
        assert_eq!(*disconnected.lock(), vec!["agent-1".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_is_independent_of_later_mutation() {
        let registry = Registry::new();
        registry.register(make_conn("agent-1", "host-1"));
        let snapshot = registry.snapshot();
        registry.register(make_conn("agent-2", "host-2"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
