//! Gateway configuration: the process-wide settings enumerated in spec.md §6.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default gRPC port for the NanoLink agent gateway.
pub const DEFAULT_GRPC_PORT: u16 = 39100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    #[serde(default)]
    pub require_authentication: bool,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_heartbeat_check_interval_secs")]
    pub heartbeat_check_interval_secs: u64,

    #[serde(default)]
    pub async_callbacks: bool,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    /// Shared bearer token agents present to `Authenticate` (external
    /// token-minting/verification is out of scope; this gateway validates
    /// against a single configured secret, spec.md §1 "out of scope").
    #[serde(default = "default_agent_token")]
    pub agent_token: String,

    /// Permission level granted to holders of `agent_token`.
    #[serde(default = "default_agent_permission_level")]
    pub agent_permission_level: u8,

    /// Optional super-admin token that bypasses every permission check.
    #[serde(default)]
    pub super_admin_token: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            require_authentication: false,
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            heartbeat_check_interval_secs: default_heartbeat_check_interval_secs(),
            async_callbacks: false,
            max_message_bytes: default_max_message_bytes(),
            subscriber_queue_depth: default_subscriber_queue_depth(),
            command_timeout_secs: default_command_timeout_secs(),
            dashboard_port: default_dashboard_port(),
            agent_token: default_agent_token(),
            agent_permission_level: default_agent_permission_level(),
            super_admin_token: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (if not set, logs to stdout).
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_grpc_port() -> u16 {
    DEFAULT_GRPC_PORT
}
fn default_heartbeat_timeout_secs() -> u64 {
    90
}
fn default_heartbeat_check_interval_secs() -> u64 {
    30
}
fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_subscriber_queue_depth() -> usize {
    256
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_dashboard_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_agent_token() -> String {
    "change-me".to_string()
}
fn default_agent_permission_level() -> u8 {
    2
}

impl GatewayConfig {
    /// Load configuration from a YAML or TOML file, falling back to
    /// defaults for anything not specified.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;

        let config: GatewayConfig = if path.extension().is_some_and(|e| e == "toml") {
            toml::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// A config with every default filled in, for `--generate-config`.
    pub fn sample() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_check_interval_secs == 0 {
            anyhow::bail!("heartbeat_check_interval_secs must be greater than zero");
        }
        if self.heartbeat_timeout_secs == 0 {
            anyhow::bail!("heartbeat_timeout_secs must be greater than zero");
        }
        if self.subscriber_queue_depth == 0 {
            anyhow::bail!("subscriber_queue_depth must be greater than zero");
        }
        if self.agent_permission_level > 3 {
            anyhow::bail!("agent_permission_level must be between 0 and 3");
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}
