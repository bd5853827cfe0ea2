//! The dashboard hub (spec.md §4.H): tracks subscribers and fans out
//! agent/metrics/summary events to them.
//!
//! Grounded on `iwismer-rusty-timer`'s broadcast registry shape
//! (`services/server/src/state.rs`, `dashboard_events.rs`): a map of live
//! subscribers behind a lock, with tagged JSON events pushed out to each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;

use crate::agent_connection::SharedAgentConnection;
use crate::collaborators::SharedMetricsSink;
use crate::dashboard::subscriber::{Frame, Subscriber};
use crate::registry::Registry;

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub permission_level: u8,
    pub connected_at_unix_ms: i64,
}

impl From<&SharedAgentConnection> for AgentSummary {
    fn from(conn: &SharedAgentConnection) -> Self {
        let elapsed = conn.connected_at.elapsed();
        let connected_at_unix_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|since_epoch| since_epoch.saturating_sub(elapsed).as_millis() as i64)
            .unwrap_or(0);
        Self {
            agent_id: conn.agent_id.clone(),
            hostname: conn.hostname.clone(),
            os: conn.os.clone(),
            arch: conn.arch.clone(),
            permission_level: conn.permission_level(),
            connected_at_unix_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub agent_count: usize,
    pub generated_at_unix_ms: i64,
}

pub struct Hub {
    registry: Registry,
    metrics: SharedMetricsSink,
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    queue_depth: usize,
}

impl Hub {
    pub fn new(registry: Registry, metrics: SharedMetricsSink, queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            queue_depth,
        })
    }

    /// Registers event callbacks on the registry so connect/disconnect
    /// always reach the hub, without the registry depending on the hub
    /// type directly (spec.md §9: break the cycle with an event sink).
    pub fn install(self: &Arc<Self>) {
        let hub = self.clone();
        self.registry.on_connect(Arc::new(move |conn| {
            hub.broadcast_agent_update(conn);
        }));

        let hub = self.clone();
        self.registry.on_disconnect(Arc::new(move |agent_id, _reason| {
            hub.broadcast_agent_offline(agent_id);
        }));
    }

    pub fn add_subscriber(&self, user_id: String, username: String) -> (Arc<Subscriber>, tokio::sync::mpsc::Receiver<Frame>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (subscriber, rx) = Subscriber::new(id, user_id, username, self.queue_depth);
        self.subscribers.write().insert(id, subscriber.clone());

        subscriber.try_send(Frame::new("agents", self.agents_snapshot_json()));
        subscriber.try_send(Frame::new("metrics", self.metrics_snapshot_json()));
        subscriber.try_send(Frame::new("summary", self.summary_json()));

        (subscriber, rx)
    }

    pub fn remove_subscriber(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.write().remove(&id) {
            subscriber.close();
        }
    }

    fn agents_snapshot_json(&self) -> serde_json::Value {
        let agents: Vec<AgentSummary> = self.registry.snapshot().iter().map(AgentSummary::from).collect();
        serde_json::to_value(agents).unwrap_or(serde_json::Value::Array(vec![]))
    }

    fn metrics_snapshot_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for conn in self.registry.snapshot() {
            if let Some(latest) = self.metrics.latest_full_json(&conn.agent_id) {
                map.insert(conn.agent_id.clone(), latest);
            }
        }
        serde_json::Value::Object(map)
    }

    fn summary_json(&self) -> serde_json::Value {
        serde_json::to_value(Summary {
            agent_count: self.registry.len(),
            generated_at_unix_ms: chrono::Utc::now().timestamp_millis(),
        })
        .unwrap_or(serde_json::Value::Null)
    }

    /// Broadcast an `agent_update` for one agent's public fields. Always
    /// delivered to every subscriber regardless of its subscription set
    /// (spec.md §4.H: `agent_update` is in the always-deliver set via
    /// `agents`/`summary`; individual field scoping applies to `metrics`).
    pub fn broadcast_agent_update(&self, conn: &SharedAgentConnection) {
        let summary = AgentSummary::from(conn);
        let data = serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null);
        self.broadcast_always(Frame::new("agent_update", data));
    }

    /// Broadcast that an agent went offline. Always delivered.
    pub fn broadcast_agent_offline(&self, agent_id: &str) {
        self.broadcast_always(Frame::new("agent_offline", serde_json::Value::String(agent_id.to_string())));
    }

    /// Broadcast a metrics update for one agent, scoped to subscribers
    /// that asked for this agent (or asked for nothing in particular).
    pub fn broadcast_metrics_update(&self, agent_id: &str, metrics: serde_json::Value) {
        let data = serde_json::json!({ "agentId": agent_id, "metrics": metrics });
        let frame = Frame::new("metrics", data);
        for subscriber in self.subscribers.read().values() {
            if subscriber.wants(agent_id) {
                subscriber.try_send(frame.clone());
            }
        }
    }

    pub fn broadcast_summary(&self) {
        self.broadcast_always(Frame::new("summary", self.summary_json()));
    }

    fn broadcast_always(&self, frame: Frame) {
        for subscriber in self.subscribers.read().values() {
            subscriber.try_send(frame.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
