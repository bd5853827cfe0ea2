//! Error kinds surfaced by the gateway core.
//!
//! Every variant here is recoverable at the caller: the stream handler
//! terminates only its own stream on a transport error, and the registry,
//! reaper, and hub treat their own operations as infallible (they log and
//! continue rather than propagate).

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: required level {required}, have {actual}")]
    PermissionDenied { required: u8, actual: u8 },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("command timed out")]
    CommandTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

impl From<GatewayError> for tonic::Status {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthenticated => tonic::Status::unauthenticated(err.to_string()),
            GatewayError::PermissionDenied { .. } => {
                tonic::Status::permission_denied(err.to_string())
            }
            GatewayError::AgentNotFound(_) => tonic::Status::not_found(err.to_string()),
            GatewayError::InvalidArgument(_) => tonic::Status::invalid_argument(err.to_string()),
            GatewayError::MessageTooLarge { .. } => {
                tonic::Status::resource_exhausted(err.to_string())
            }
            GatewayError::CommandTimeout => tonic::Status::deadline_exceeded(err.to_string()),
            GatewayError::TransportError(_) | GatewayError::ConnectionClosed => {
                tonic::Status::unavailable(err.to_string())
            }
        }
    }
}

impl GatewayError {
    /// HTTP status code for REST/dashboard callers (spec.md §7).
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthenticated => 401,
            GatewayError::PermissionDenied { .. } => 403,
            GatewayError::AgentNotFound(_) => 404,
            GatewayError::InvalidArgument(_) => 400,
            GatewayError::MessageTooLarge { .. } => 413,
            GatewayError::CommandTimeout => 504,
            GatewayError::TransportError(_) | GatewayError::ConnectionClosed => 503,
        }
    }
}
