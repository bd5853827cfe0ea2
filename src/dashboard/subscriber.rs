//! A single dashboard WebSocket subscriber (spec.md §3, §4.H).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

/// One framed dashboard message: `{"type": ..., "timestamp": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(kind: &'static str, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

pub struct Subscriber {
    pub id: u64,
    pub user_id: String,
    pub username: String,
    tx: mpsc::Sender<Frame>,
    subscriptions: RwLock<HashSet<String>>,
    terminal: AtomicBool,
}

impl Subscriber {
    pub fn new(id: u64, user_id: String, username: String, queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (
            Arc::new(Self {
                id,
                user_id,
                username,
                tx,
                subscriptions: RwLock::new(HashSet::new()),
                terminal: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Non-blocking enqueue. Drops the new frame (never the producer, never
    /// an already-queued frame) when the send queue is full — spec.md §5:
    /// "drop new when full, so that already-queued state snapshots are
    /// preserved."
    pub fn try_send(&self, frame: Frame) {
        if self.is_terminal() {
            return;
        }
        if self.tx.try_send(frame).is_err() {
            // Full or closed: both are fine to ignore here. A closed
            // channel means the writer task is already tearing down.
        }
    }

    pub fn subscribe(&self, agent_id: String) {
        self.subscriptions.write().insert(agent_id);
    }

    pub fn unsubscribe(&self, agent_id: &str) {
        self.subscriptions.write().remove(agent_id);
    }

    /// Whether this subscriber wants updates scoped to `agent_id`. An
    /// empty subscription set means "no filter" — everything is wanted.
    pub fn wants(&self, agent_id: &str) -> bool {
        let subs = self.subscriptions.read();
        subs.is_empty() || subs.contains(agent_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Idempotent; guarded by the terminal flag so the send queue is
    /// dropped exactly once.
    pub fn close(&self) {
        self.terminal.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_new_frame_not_producer() {
        let (sub, mut rx) = Subscriber::new(1, "u1".to_string(), "alice".to_string(), 2);
        for i in 0..5 {
            sub.try_send(Frame::new("ping", serde_json::json!(i)));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 2);
    }

    #[tokio::test]
    async fn wants_with_empty_subscription_set_matches_everything() {
        let (sub, _rx) = Subscriber::new(1, "u1".to_string(), "alice".to_string(), 4);
        assert!(sub.wants("agent-1"));
        sub.subscribe("agent-1".to_string());
        assert!(sub.wants("agent-1"));
        assert!(!sub.wants("agent-2"));
        sub.unsubscribe("agent-1");
        assert!(sub.wants("agent-2"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_suppresses_sends() {
        let (sub, mut rx) = Subscriber::new(1, "u1".to_string(), "alice".to_string(), 4);
        sub.close();
        sub.close();
        sub.try_send(Frame::new("ping", serde_json::Value::Null));
        assert!(rx.try_recv().is_err());
    }
}
