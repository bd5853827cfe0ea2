//! Command router (spec.md §4.I): the application-facing façade over
//! §4.D (`AgentConnection::send_command`) and §4.F (the registry lookup),
//! adding the caller-side permission check and audit logging.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent_connection::CommandRequest;
use crate::collaborators::{AuditEntry, SharedAuditSink, SharedPermissionService};
use crate::error::GatewayError;
use crate::permission::required_level;
use crate::proto::CommandType;
use crate::registry::Registry;
use crate::telemetry::CommandResult;

pub struct CommandRouter {
    registry: Registry,
    permissions: SharedPermissionService,
    audit: SharedAuditSink,
}

impl CommandRouter {
    pub fn new(registry: Registry, permissions: SharedPermissionService, audit: SharedAuditSink) -> Arc<Self> {
        Arc::new(Self {
            registry,
            permissions,
            audit,
        })
    }

    /// (1) resolve the caller's effective permission level, (2) look up
    /// the agent, (3) dispatch via `AgentConnection::send_command`, (4)
    /// record the outcome to the audit sink (spec.md §4.I).
    pub async fn execute(
        &self,
        caller_token: &str,
        agent_id: &str,
        command_type: CommandType,
        target: String,
        params: HashMap<String, String>,
        super_token: Option<String>,
    ) -> Result<CommandResult, GatewayError> {
        let effective_level = self.permissions.effective_level(caller_token, agent_id).await;
        let required = required_level(command_type);

        if effective_level < required {
            self.audit
                .record(AuditEntry::new(agent_id, command_type, &target, effective_level, false))
                .await;
            return Err(GatewayError::PermissionDenied {
                required,
                actual: effective_level,
            });
        }

        let conn = self
            .registry
            .get(agent_id)
            .ok_or_else(|| GatewayError::AgentNotFound(agent_id.to_string()))?;

        let result = conn
            .send_command(CommandRequest {
                command_type,
                target: target.clone(),
                params,
                super_token: super_token.unwrap_or_default(),
            })
            .await;

        self.audit
            .record(AuditEntry::new(agent_id, command_type, &target, effective_level, result.is_ok()))
            .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_connection::AgentConnection;
    use crate::collaborators::{InMemoryAuditSink, StaticTokenAuthority};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn make_conn(agent_id: &str, hostname: &str, level: u8) -> Arc<AgentConnection> {
        Arc::new(AgentConnection::new(
            agent_id.to_string(),
            hostname.to_string(),
            "linux".to_string(),
            "x86_64".to_string(),
            "1.0.0".to_string(),
            level,
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn execute_refuses_without_looking_up_agent_when_permission_denied() {
        let registry = Registry::new();
        let permissions = Arc::new(StaticTokenAuthority::new("agent-token".to_string(), 0, None));
        let audit = Arc::new(InMemoryAuditSink::new());
        let router = CommandRouter::new(registry, permissions, audit.clone());

        let result = router
            .execute("agent-token", "missing-agent", CommandType::ShellExecute, String::new(), HashMap::new(), None)
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::PermissionDenied { required: 3, actual: 0 })
        ));
        assert_eq!(audit.snapshot().len(), 1);
        assert!(!audit.snapshot()[0].allowed);
    }

    #[tokio::test]
    async fn execute_returns_agent_not_found_when_permitted_but_absent() {
        let registry = Registry::new();
        let permissions = Arc::new(StaticTokenAuthority::new("root-token".to_string(), 0, Some("root-token".to_string())));
        let audit = Arc::new(InMemoryAuditSink::new());
        let router = CommandRouter::new(registry, permissions, audit);

        let result = router
            .execute("root-token", "missing-agent", CommandType::ProcessList, String::new(), HashMap::new(), None)
            .await;

        assert!(matches!(result, Err(GatewayError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn execute_round_trips_through_agent_connection() {
        let registry = Registry::new();
        let conn = make_conn("agent-1", "host-1", 2);
        let (tx, mut rx) = mpsc::channel(8);
        conn.attach(tx);
        registry.register(conn.clone());

        let permissions = Arc::new(StaticTokenAuthority::new("agent-token".to_string(), 2, None));
        let audit = Arc::new(InMemoryAuditSink::new());
        let router = CommandRouter::new(registry, permissions, audit.clone());

        let router2 = router.clone();
        let handle = tokio::spawn(async move {
            router2
                .execute(
                    "agent-token",
                    "agent-1",
                    CommandType::ServiceRestart,
                    "nginx".to_string(),
                    HashMap::new(),
                    None,
                )
                .await
        });

        let sent = rx.recv().await.unwrap().unwrap();
        let command_id = match sent.response {
            Some(crate::proto::metrics_stream_response::Response::Command(cmd)) => cmd.command_id,
            _ => panic!("expected Command"),
        };

        conn.deliver_result(
            &command_id,
            crate::telemetry::CommandResult {
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
        assert_eq!(audit.snapshot().len(), 1);
        assert!(audit.snapshot()[0].allowed);
    }
}
