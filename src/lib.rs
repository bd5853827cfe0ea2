//! NanoLink agent gateway: the streaming ingest core described in
//! `SPEC_FULL.md` §2 — sanitization, the permission model, telemetry value
//! objects, per-stream agent state, the fleet registry, the gRPC stream
//! service, the heartbeat reaper, the dashboard hub, and the command
//! router.

#[allow(clippy::large_enum_variant)]
pub mod proto {
    tonic::include_proto!("nanolink");
}

pub mod agent_connection;
pub mod collaborators;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod permission;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod stream_service;
pub mod telemetry;

pub use agent_connection::{AgentConnection, CommandRequest, SharedAgentConnection};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use reaper::Reaper;
pub use registry::Registry;
pub use router::CommandRouter;
pub use stream_service::{GatewayService, GatewayServiceConfig};
