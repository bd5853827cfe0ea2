//! Per-stream agent state (spec.md §4.D).
//!
//! Grounded on the "promise registry" pattern described in spec.md §9: a
//! per-connection map from command id to a single-shot completion, built
//! the way the teacher agent crate uses `tokio::sync::{RwLock, broadcast}`
//! for its own connection-status bookkeeping (`connection/mod.rs`,
//! `ConnectionManager`), here turned inside-out for the server side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::warn;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::permission::{check_permission, required_level};
use crate::proto;
use crate::telemetry::CommandResult;

/// Enqueues one outbound framed message on the agent's stream. `None`
/// until the stream's write side has attached (spec.md §3: "nil until the
/// stream attaches").
pub type SendHandle = mpsc::Sender<Result<proto::MetricsStreamResponse, tonic::Status>>;

/// A command the caller wants dispatched to an agent. `command_id` is
/// minted fresh inside `send_command`, never supplied by the caller.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command_type: proto::CommandType,
    pub target: String,
    pub params: HashMap<String, String>,
    pub super_token: String,
}

struct PendingTable {
    slots: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, id: String, tx: oneshot::Sender<CommandResult>) {
        self.slots.lock().insert(id, tx);
    }

    /// Locates and removes the pending slot for `id`; no-op if absent
    /// (late arrival after timeout, per spec.md §4.D).
    fn take(&self, id: &str) -> Option<oneshot::Sender<CommandResult>> {
        self.slots.lock().remove(id)
    }

    fn remove(&self, id: &str) {
        self.slots.lock().remove(id);
    }

    /// Drains every still-pending slot. Used by `close()` to fail every
    /// outstanding future with `ConnectionClosed`.
    fn drain(&self) -> Vec<oneshot::Sender<CommandResult>> {
        self.slots.lock().drain().map(|(_, tx)| tx).collect()
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Server-side per-stream state for one connected agent (spec.md §3).
pub struct AgentConnection {
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    permission_level: Mutex<u8>,
    pub connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    send_handle: Mutex<Option<SendHandle>>,
    pending: PendingTable,
    terminal: std::sync::atomic::AtomicBool,
    done: Notify,
    command_timeout: Duration,
}

impl AgentConnection {
    pub fn new(
        agent_id: String,
        hostname: String,
        os: String,
        arch: String,
        agent_version: String,
        permission_level: u8,
        command_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            agent_id,
            hostname,
            os,
            arch,
            agent_version,
            permission_level: Mutex::new(permission_level),
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            send_handle: Mutex::new(None),
            pending: PendingTable::new(),
            terminal: std::sync::atomic::AtomicBool::new(false),
            done: Notify::new(),
            command_timeout,
        }
    }

    pub fn permission_level(&self) -> u8 {
        *self.permission_level.lock()
    }

    /// Called exactly once when the stream is ready; enables outbound
    /// sends.
    pub fn attach(&self, send_handle: SendHandle) {
        *self.send_handle.lock() = Some(send_handle);
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Enqueue an outbound `DataRequest` or raw response message without
    /// going through the command/result correlation path.
    pub async fn send_response(
        &self,
        message: proto::MetricsStreamResponse,
    ) -> Result<(), GatewayError> {
        let handle = self.send_handle.lock().clone();
        match handle {
            Some(tx) => tx
                .send(Ok(message))
                .await
                .map_err(|_| GatewayError::TransportError("stream closed".to_string())),
            None => Err(GatewayError::TransportError(
                "send handle not attached".to_string(),
            )),
        }
    }

    /// Dispatch a command and await its result.
    ///
    /// Exactly one of three outcomes fires: the matching `CommandResult`
    /// is delivered, the 30s timeout elapses, or the connection closes
    /// first (spec.md §4.D, §8 invariant 2).
    pub async fn send_command(&self, request: CommandRequest) -> Result<CommandResult, GatewayError> {
        let level = self.permission_level();
        if !check_permission(request.command_type, level, false) {
            return Err(GatewayError::PermissionDenied {
                required: required_level(request.command_type),
                actual: level,
            });
        }

        if self.is_terminal() {
            return Err(GatewayError::ConnectionClosed);
        }

        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(command_id.clone(), tx);

        let command = proto::Command {
            command_id: command_id.clone(),
            r#type: request.command_type as i32,
            target: request.target,
            params: request.params,
            super_token: request.super_token,
        };

        let handle = self.send_handle.lock().clone();
        let handle = match handle {
            Some(h) => h,
            None => {
                self.pending.remove(&command_id);
                return Err(GatewayError::TransportError(
                    "send handle not attached".to_string(),
                ));
            }
        };

        if handle
            .send(Ok(proto::MetricsStreamResponse {
                response: Some(proto::metrics_stream_response::Response::Command(command)),
            }))
            .await
            .is_err()
        {
            self.pending.remove(&command_id);
            return Err(GatewayError::TransportError(
                "failed to enqueue command".to_string(),
            ));
        }

        tokio::select! {
            result = rx => {
                match result {
                    Ok(result) => Ok(result),
                    Err(_) => Err(GatewayError::ConnectionClosed),
                }
            }
            _ = tokio::time::sleep(self.command_timeout) => {
                self.pending.remove(&command_id);
                Err(GatewayError::CommandTimeout)
            }
            _ = self.done.notified() => {
                self.pending.remove(&command_id);
                Err(GatewayError::ConnectionClosed)
            }
        }
    }

    /// Locates and removes the pending slot for `id`, completing its
    /// future with `result`. No-op if absent (late arrival after timeout).
    pub fn deliver_result(&self, id: &str, result: CommandResult) {
        match self.pending.take(id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                warn!(command_id = %id, agent_id = %self.agent_id, "late or unknown command result discarded");
            }
        }
    }

    pub fn touch_heartbeat(&self, now: Instant) {
        *self.last_heartbeat.lock() = now;
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_heartbeat.lock())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Idempotent. Marks terminal, wakes any waiter blocked in
    /// `send_command`, fails every still-pending future with
    /// `ConnectionClosed`, and drops the send handle.
    pub fn close(&self) {
        if self
            .terminal
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        self.done.notify_waiters();
        // Drop every pending sender without sending a value: each paired
        // `rx` then resolves with `RecvError`, which `send_command` maps to
        // `ConnectionClosed`. Sending a synthetic result here would race
        // the `done.notified()` arm of that `select!` and could resolve
        // the command as a (fabricated) success instead.
        drop(self.pending.drain());
        *self.send_handle.lock() = None;
    }
}

pub type SharedAgentConnection = Arc<AgentConnection>;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(permission_level: u8) -> Arc<AgentConnection> {
        Arc::new(AgentConnection::new(
            "agent-1".to_string(),
            "host-1".to_string(),
            "linux".to_string(),
            "x86_64".to_string(),
            "1.0.0".to_string(),
            permission_level,
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn send_command_without_attach_fails_transport() {
        let conn = make_connection(3);
        let result = conn
            .send_command(CommandRequest {
                command_type: proto::CommandType::ProcessList,
                target: String::new(),
                params: HashMap::new(),
                super_token: String::new(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::TransportError(_))));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_command_denies_insufficient_permission() {
        let conn = make_connection(0);
        let (tx, _rx) = mpsc::channel(8);
        conn.attach(tx);
        let result = conn
            .send_command(CommandRequest {
                command_type: proto::CommandType::ShellExecute,
                target: "id".to_string(),
                params: HashMap::new(),
                super_token: String::new(),
            })
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::PermissionDenied { required: 3, actual: 0 })
        ));
    }

    #[tokio::test]
    async fn command_round_trip_resolves_with_result() {
        let conn = make_connection(3);
        let (tx, mut rx) = mpsc::channel(8);
        conn.attach(tx);

        let conn2 = conn.clone();
        let handle = tokio::spawn(async move {
            conn2
                .send_command(CommandRequest {
                    command_type: proto::CommandType::ServiceRestart,
                    target: "nginx".to_string(),
                    params: HashMap::new(),
                    super_token: String::new(),
                })
                .await
        });

        let sent = rx.recv().await.unwrap().unwrap();
        let command_id = match sent.response {
            Some(proto::metrics_stream_response::Response::Command(cmd)) => cmd.command_id,
            _ => panic!("expected Command"),
        };

        conn.deliver_result(
            &command_id,
            CommandResult {
                command_id: command_id.clone(),
                success: true,
                stdout: "restarted".to_string(),
                stderr: String::new(),
                file_data: Vec::new(),
                structured_lines: Vec::new(),
            },
        );

        let result = handle.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "restarted");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn command_times_out_and_late_result_is_discarded() {
        let conn = make_connection(3);
        let (tx, mut rx) = mpsc::channel(8);
        conn.attach(tx);

        let conn2 = conn.clone();
        let handle = tokio::spawn(async move {
            conn2
                .send_command(CommandRequest {
                    command_type: proto::CommandType::ProcessList,
                    target: String::new(),
                    params: HashMap::new(),
                    super_token: String::new(),
                })
                .await
        });

        let sent = rx.recv().await.unwrap().unwrap();
        let command_id = match sent.response {
            Some(proto::metrics_stream_response::Response::Command(cmd)) => cmd.command_id,
            _ => panic!("expected Command"),
        };

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(GatewayError::CommandTimeout)));

        // Late result after timeout must not panic and must be a no-op.
        conn.deliver_result(
            &command_id,
            CommandResult {
                command_id,
                success: true,
                stdout: String::new(),
                stderr: String::new(),
                file_data: Vec::new(),
                structured_lines: Vec::new(),
            },
        );
    }

    #[tokio::test]
    async fn close_fails_pending_commands_and_is_idempotent() {
        let conn = make_connection(3);
        let (tx, _rx) = mpsc::channel(8);
        conn.attach(tx);

        let conn2 = conn.clone();
        let handle = tokio::spawn(async move {
            conn2
                .send_command(CommandRequest {
                    command_type: proto::CommandType::ProcessList,
                    target: String::new(),
                    params: HashMap::new(),
                    super_token: String::new(),
                })
                .await
        });

        // Give the spawned task a chance to register its pending slot.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close();
        conn.close(); // idempotent

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(GatewayError::ConnectionClosed)));
        assert!(conn.is_terminal());
    }

    #[test]
    fn heartbeat_age_reflects_touch() {
        let conn = make_connection(0);
        let t0 = Instant::now();
        conn.touch_heartbeat(t0);
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(conn.heartbeat_age(t1), Duration::from_secs(5));
    }
}
