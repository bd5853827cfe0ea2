//! Collaborator traits (spec.md §6): the seams the gateway calls out
//! through for authentication, permission resolution, metrics storage, and
//! audit logging, plus minimal in-memory stand-ins used by the binary and
//! the integration tests.
//!
//! Grounded on the teacher agent's `management/token.rs` (token issuance)
//! and `management/audit.rs` (JSON-lines audit entries), and on
//! `iwismer-rusty-timer`'s `auth.rs` (`validate_token`/`extract_bearer`)
//! for the trait-at-the-boundary shape.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::proto::CommandType;
use crate::telemetry::{FullMetrics, PeriodicData, RealtimeMetrics, StaticInfo};

/// Verifies an agent- or user-presented bearer token.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the resolved permission level for a valid agent token, or
    /// `None` if the token is unknown or revoked.
    async fn validate_agent_token(&self, token: &str) -> Option<u8>;

    /// Returns `true` if `token` is the configured super-admin token,
    /// using a constant-time comparison.
    async fn is_super_admin_token(&self, token: &str) -> bool;
}

/// Resolves a caller's effective permission level for a given agent
/// (spec.md §4.B: max of an explicit per-agent grant and the caller's
/// group grants).
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn effective_level(&self, caller_token: &str, agent_id: &str) -> u8;
}

/// Receives telemetry as it arrives off each agent's stream.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_full(&self, agent_id: &str, metrics: &FullMetrics);
    async fn record_realtime(&self, agent_id: &str, metrics: &RealtimeMetrics);
    async fn record_static(&self, agent_id: &str, info: &StaticInfo);
    async fn record_periodic(&self, agent_id: &str, data: &PeriodicData);

    /// JSON projection of the latest full snapshot for one agent, used by
    /// the dashboard hub's initial `metrics` frame (spec.md §4.H). `None`
    /// if nothing has arrived for this agent yet. Sinks that don't keep a
    /// latest-snapshot view (e.g. a pure time-series writer) may return
    /// `None` unconditionally.
    fn latest_full_json(&self, agent_id: &str) -> Option<serde_json::Value>;
}

/// Records every command dispatch for later review (spec.md §4.B, §4.I).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub command_type: String,
    pub target: String,
    pub caller_level: u8,
    pub allowed: bool,
}

impl AuditEntry {
    pub fn new(agent_id: &str, command_type: CommandType, target: &str, caller_level: u8, allowed: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            command_type: format!("{command_type:?}"),
            target: target.to_string(),
            caller_level,
            allowed,
        }
    }
}

/// A fixed-token `TokenValidator`/`PermissionService` for single-operator
/// deployments: one shared agent token, one optional super-admin token.
/// Mirrors the teacher's `management/token.rs` style of a generated opaque
/// token compared in constant time.
pub struct StaticTokenAuthority {
    agent_token: String,
    agent_permission_level: u8,
    super_admin_token: Option<String>,
}

impl StaticTokenAuthority {
    pub fn new(agent_token: String, agent_permission_level: u8, super_admin_token: Option<String>) -> Self {
        Self {
            agent_token,
            agent_permission_level,
            super_admin_token,
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenAuthority {
    async fn validate_agent_token(&self, token: &str) -> Option<u8> {
        if constant_time_eq(token, &self.agent_token) {
            Some(self.agent_permission_level)
        } else {
            None
        }
    }

    async fn is_super_admin_token(&self, token: &str) -> bool {
        match &self.super_admin_token {
            Some(expected) => constant_time_eq(token, expected),
            None => false,
        }
    }
}

#[async_trait]
impl PermissionService for StaticTokenAuthority {
    async fn effective_level(&self, caller_token: &str, _agent_id: &str) -> u8 {
        if self.is_super_admin_token(caller_token).await {
            return 3;
        }
        self.validate_agent_token(caller_token).await.unwrap_or(0)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// An in-memory `MetricsSink` that keeps only the latest snapshot per
/// agent, enough for the dashboard hub's initial-state send (spec.md
/// §4.H). Not a time series store — persistence is out of scope.
#[derive(Default)]
pub struct LatestMetricsStore {
    full: RwLock<HashMap<String, FullMetrics>>,
    realtime: RwLock<HashMap<String, RealtimeMetrics>>,
    static_info: RwLock<HashMap<String, StaticInfo>>,
    periodic: RwLock<HashMap<String, PeriodicData>>,
}

impl LatestMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_full(&self, agent_id: &str) -> Option<FullMetrics> {
        self.full.read().get(agent_id).cloned()
    }

    pub fn latest_realtime(&self, agent_id: &str) -> Option<RealtimeMetrics> {
        self.realtime.read().get(agent_id).cloned()
    }

    pub fn latest_static(&self, agent_id: &str) -> Option<StaticInfo> {
        self.static_info.read().get(agent_id).cloned()
    }

    pub fn latest_periodic(&self, agent_id: &str) -> Option<PeriodicData> {
        self.periodic.read().get(agent_id).cloned()
    }

    pub fn remove(&self, agent_id: &str) {
        self.full.write().remove(agent_id);
        self.realtime.write().remove(agent_id);
        self.static_info.write().remove(agent_id);
        self.periodic.write().remove(agent_id);
    }
}

#[async_trait]
impl MetricsSink for LatestMetricsStore {
    async fn record_full(&self, agent_id: &str, metrics: &FullMetrics) {
        self.full.write().insert(agent_id.to_string(), metrics.clone());
    }

    async fn record_realtime(&self, agent_id: &str, metrics: &RealtimeMetrics) {
        self.realtime.write().insert(agent_id.to_string(), metrics.clone());
    }

    async fn record_static(&self, agent_id: &str, info: &StaticInfo) {
        self.static_info.write().insert(agent_id.to_string(), info.clone());
    }

    async fn record_periodic(&self, agent_id: &str, data: &PeriodicData) {
        self.periodic.write().insert(agent_id.to_string(), data.clone());
    }

    fn latest_full_json(&self, agent_id: &str) -> Option<serde_json::Value> {
        let metrics = self.full.read().get(agent_id).cloned()?;
        serde_json::to_value(metrics).ok()
    }
}

/// Appends audit entries to an in-process log, mirroring the teacher's
/// `management/audit.rs` JSON-lines `AuditState`, minus file rotation
/// (out of scope for the gateway's audit sink).
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        tracing::info!(
            agent_id = %entry.agent_id,
            command_type = %entry.command_type,
            allowed = entry.allowed,
            "command dispatched"
        );
        self.entries.write().push(entry);
    }
}

pub type SharedTokenValidator = Arc<dyn TokenValidator>;
pub type SharedPermissionService = Arc<dyn PermissionService>;
pub type SharedMetricsSink = Arc<dyn MetricsSink>;
pub type SharedAuditSink = Arc<dyn AuditSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_authority_validates_agent_token() {
        let authority = StaticTokenAuthority::new("agent-secret".to_string(), 2, Some("root-secret".to_string()));
        assert_eq!(authority.validate_agent_token("agent-secret").await, Some(2));
        assert_eq!(authority.validate_agent_token("wrong").await, None);
        assert!(authority.is_super_admin_token("root-secret").await);
        assert!(!authority.is_super_admin_token("agent-secret").await);
    }

    #[tokio::test]
    async fn effective_level_prefers_super_admin() {
        let authority = StaticTokenAuthority::new("agent-secret".to_string(), 1, Some("root-secret".to_string()));
        assert_eq!(authority.effective_level("root-secret", "agent-1").await, 3);
        assert_eq!(authority.effective_level("agent-secret", "agent-1").await, 1);
        assert_eq!(authority.effective_level("unknown", "agent-1").await, 0);
    }

    #[tokio::test]
    async fn metrics_store_keeps_latest_per_agent() {
        let store = LatestMetricsStore::new();
        let metrics = FullMetrics::from(crate::proto::Metrics {
            hostname: "host-1".to_string(),
            ..Default::default()
        });
        store.record_full("agent-1", &metrics).await;
        assert!(store.latest_full("agent-1").is_some());
        assert!(store.latest_full("agent-2").is_none());
        store.remove("agent-1");
        assert!(store.latest_full("agent-1").is_none());
    }

    #[tokio::test]
    async fn audit_sink_accumulates_entries() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditEntry::new("agent-1", CommandType::ProcessList, "", 0, true))
            .await;
        assert_eq!(sink.snapshot().len(), 1);
    }
}
