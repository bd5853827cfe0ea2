//! Stream service (spec.md §4.F): the bidirectional-streaming gRPC
//! handler, the hardest single piece of the gateway. Multiplexes six
//! inbound message kinds onto registry state and subscriber fan-out, and
//! serializes three outbound kinds onto one writer task per stream.
//!
//! Grounded on the teacher's `connection/grpc.rs` for the wire shape
//! (the oneof variants and the AgentInit-as-first-message convention) and
//! on `iwismer-rusty-timer`'s `ws_forwarder.rs` for the server-side
//! event-loop shape (`tokio::select!` over transport, heartbeat, and a
//! command channel — inlined here as a single inbound-message loop since
//! tonic already owns the transport read/write split).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent_connection::{AgentConnection, SendHandle, SharedAgentConnection};
use crate::collaborators::SharedMetricsSink;
use crate::dashboard::hub::Hub;
use crate::proto::nano_link_service_server::NanoLinkService;
use crate::proto::{
    metrics_stream_request, metrics_stream_response, AuthRequest, AuthResponse, HeartbeatAck,
    Metrics, MetricsStreamRequest, MetricsStreamResponse, ReportAck,
};
use crate::registry::Registry;
use crate::sanitize::{sanitize_agent_id, sanitize_hostname, sanitize_string};
use crate::telemetry::{CommandResult, FullMetrics, PeriodicData, StaticInfo};

pub struct GatewayServiceConfig {
    pub require_authentication: bool,
    pub async_callbacks: bool,
    pub command_timeout: Duration,
    pub outbound_queue_depth: usize,
}

/// The gRPC-facing service. Holds only shared, cheaply-cloneable state;
/// a fresh task is spawned per stream.
#[derive(Clone)]
pub struct GatewayService {
    registry: Registry,
    token_validator: crate::collaborators::SharedTokenValidator,
    metrics: SharedMetricsSink,
    hub: Arc<Hub>,
    config: Arc<GatewayServiceConfig>,
}

impl GatewayService {
    pub fn new(
        registry: Registry,
        token_validator: crate::collaborators::SharedTokenValidator,
        metrics: SharedMetricsSink,
        hub: Arc<Hub>,
        config: GatewayServiceConfig,
    ) -> Self {
        Self {
            registry,
            token_validator,
            metrics,
            hub,
            config: Arc::new(config),
        }
    }

    fn mint_agent_id() -> String {
        sanitize_agent_id(&Uuid::new_v4().to_string())
    }

    /// Shared by the lazy-registration path (first `Metrics`/`StaticInfo`
    /// on an unauthenticated stream): pins the connection at `READ_ONLY`
    /// and logs a warning (spec.md §4.F step 3, §9 "unauthenticated lazy
    /// registration").
    fn register_lazy(&self, hostname: &str, os: &str, arch: &str, send_handle: SendHandle) -> SharedAgentConnection {
        let agent_id = Self::mint_agent_id();
        let hostname = sanitize_hostname(hostname);
        warn!(%agent_id, %hostname, "registering agent without prior authentication (READ_ONLY)");
        let conn = Arc::new(AgentConnection::new(
            agent_id,
            hostname,
            sanitize_string(os),
            sanitize_string(arch),
            sanitize_string("unknown"),
            0,
            self.config.command_timeout,
        ));
        conn.attach(send_handle);
        self.registry.register(conn.clone());
        conn
    }

    async fn forward_full(&self, conn: &SharedAgentConnection, metrics: FullMetrics) {
        self.hub.broadcast_metrics_update(
            &conn.agent_id,
            serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null),
        );
        let sink = self.metrics.clone();
        let agent_id = conn.agent_id.clone();
        if self.config.async_callbacks {
            tokio::spawn(async move { sink.record_full(&agent_id, &metrics).await });
        } else {
            sink.record_full(&conn.agent_id, &metrics).await;
        }
    }

    async fn forward_realtime(&self, conn: &SharedAgentConnection, metrics: crate::telemetry::RealtimeMetrics) {
        self.hub.broadcast_metrics_update(
            &conn.agent_id,
            serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null),
        );
        let sink = self.metrics.clone();
        let agent_id = conn.agent_id.clone();
        if self.config.async_callbacks {
            tokio::spawn(async move { sink.record_realtime(&agent_id, &metrics).await });
        } else {
            sink.record_realtime(&conn.agent_id, &metrics).await;
        }
    }

    async fn forward_static(&self, conn: &SharedAgentConnection, info: StaticInfo) {
        let sink = self.metrics.clone();
        let agent_id = conn.agent_id.clone();
        if self.config.async_callbacks {
            tokio::spawn(async move { sink.record_static(&agent_id, &info).await });
        } else {
            sink.record_static(&conn.agent_id, &info).await;
        }
    }

    async fn forward_periodic(&self, conn: &SharedAgentConnection, data: PeriodicData) {
        let sink = self.metrics.clone();
        let agent_id = conn.agent_id.clone();
        if self.config.async_callbacks {
            tokio::spawn(async move { sink.record_periodic(&agent_id, &data).await });
        } else {
            sink.record_periodic(&conn.agent_id, &data).await;
        }
    }

    async fn run_stream(self, mut inbound: Streaming<MetricsStreamRequest>, tx: SendHandle) {
        let mut conn: Option<SharedAgentConnection> = None;

        loop {
            let next = inbound.message().await;
            let request = match next {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(status) => {
                    debug!(error = %status, "stream read error");
                    break;
                }
            };

            match request.request {
                Some(metrics_stream_request::Request::AgentInit(init)) => {
                    if !init.agent_id.is_empty() {
                        if let Some(existing) = self.registry.get(&init.agent_id) {
                            existing.attach(tx.clone());
                            existing.touch_heartbeat(Instant::now());
                            conn = Some(existing);
                            continue;
                        }
                    }
                    if conn.is_none() && !self.config.require_authentication {
                        conn = Some(self.register_lazy(&init.hostname, &init.os, &init.arch, tx.clone()));
                    } else if conn.is_none() {
                        let _ = tx
                            .send(Err(Status::unauthenticated(
                                "unknown agent_id and authentication is required",
                            )))
                            .await;
                        break;
                    }
                }

                Some(metrics_stream_request::Request::Heartbeat(hb)) => {
                    if let Some(c) = &conn {
                        c.touch_heartbeat(Instant::now());
                        let ack = MetricsStreamResponse {
                            response: Some(metrics_stream_response::Response::HeartbeatAck(HeartbeatAck {
                                timestamp: hb.timestamp,
                            })),
                        };
                        if tx.send(Ok(ack)).await.is_err() {
                            break;
                        }
                    }
                }

                Some(metrics_stream_request::Request::Metrics(m)) => {
                    if conn.is_none() {
                        if self.config.require_authentication {
                            let _ = tx
                                .send(Err(Status::unauthenticated("stream must authenticate before sending metrics")))
                                .await;
                            break;
                        }
                        conn = Some(self.register_lazy(&m.hostname, "", "", tx.clone()));
                    }
                    let c = conn.as_ref().unwrap();
                    c.touch_heartbeat(Instant::now());
                    let mut metrics = FullMetrics::from(m);
                    metrics.hostname = c.hostname.clone();
                    self.forward_full(c, metrics).await;
                }

                Some(metrics_stream_request::Request::StaticInfo(info)) => {
                    if conn.is_none() {
                        if self.config.require_authentication {
                            let _ = tx
                                .send(Err(Status::unauthenticated("stream must authenticate before sending static info")))
                                .await;
                            break;
                        }
                        conn = Some(self.register_lazy("unknown", "", "", tx.clone()));
                    }
                    let c = conn.as_ref().unwrap();
                    c.touch_heartbeat(Instant::now());
                    self.forward_static(c, StaticInfo::from(info)).await;
                }

                Some(metrics_stream_request::Request::Realtime(realtime)) => {
                    if let Some(c) = conn.clone() {
                        c.touch_heartbeat(Instant::now());
                        self.forward_realtime(&c, realtime.into()).await;
                    }
                }

                Some(metrics_stream_request::Request::Periodic(periodic)) => {
                    if let Some(c) = conn.clone() {
                        c.touch_heartbeat(Instant::now());
                        self.forward_periodic(&c, periodic.into()).await;
                    }
                }

                Some(metrics_stream_request::Request::CommandResult(result)) => {
                    if let Some(c) = &conn {
                        c.deliver_result(&result.command_id.clone(), CommandResult::from(result));
                    }
                }

                None => {}
            }
        }

        if let Some(c) = conn {
            self.registry.unregister(&c.agent_id, &c);
        }
    }
}

pub type StreamMetricsResult = Result<Response<ReceiverStream<Result<MetricsStreamResponse, Status>>>, Status>;

#[tonic::async_trait]
impl NanoLinkService for GatewayService {
    async fn authenticate(&self, request: Request<AuthRequest>) -> Result<Response<AuthResponse>, Status> {
        let req = request.into_inner();
        let level = self.token_validator.validate_agent_token(&req.token).await;

        let Some(level) = level else {
            return Ok(Response::new(AuthResponse {
                success: false,
                permission_level: 0,
                error_message: "invalid token".to_string(),
                agent_id: String::new(),
            }));
        };

        let agent_id = Self::mint_agent_id();
        let hostname = sanitize_hostname(&req.hostname);
        info!(%agent_id, %hostname, level, "agent authenticated");

        let conn = Arc::new(AgentConnection::new(
            agent_id.clone(),
            hostname,
            sanitize_string(&req.os),
            sanitize_string(&req.arch),
            sanitize_string(&req.agent_version),
            level,
            self.config.command_timeout,
        ));
        self.registry.register(conn);

        Ok(Response::new(AuthResponse {
            success: true,
            permission_level: level as i32,
            error_message: String::new(),
            agent_id,
        }))
    }

    type StreamMetricsStream = ReceiverStream<Result<MetricsStreamResponse, Status>>;

    async fn stream_metrics(&self, request: Request<Streaming<MetricsStreamRequest>>) -> StreamMetricsResult {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth);

        let initial_ack = MetricsStreamResponse {
            response: Some(metrics_stream_response::Response::HeartbeatAck(HeartbeatAck {
                timestamp: unix_millis(),
            })),
        };
        if tx.send(Ok(initial_ack)).await.is_err() {
            return Err(Status::unavailable("stream closed before it could be established"));
        }

        let service = self.clone();
        tokio::spawn(async move { service.run_stream(inbound, tx).await });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn report_metrics(&self, request: Request<Metrics>) -> Result<Response<ReportAck>, Status> {
        let metrics = FullMetrics::from(request.into_inner());
        let agent_id = sanitize_agent_id(&metrics.hostname);
        if self.config.async_callbacks {
            let sink = self.metrics.clone();
            tokio::spawn(async move { sink.record_full(&agent_id, &metrics).await });
        } else {
            self.metrics.record_full(&agent_id, &metrics).await;
        }
        Ok(Response::new(ReportAck { success: true }))
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LatestMetricsStore, StaticTokenAuthority};

    fn make_service(require_authentication: bool) -> GatewayService {
        let registry = Registry::new();
        let token_validator: crate::collaborators::SharedTokenValidator =
            Arc::new(StaticTokenAuthority::new("agent-token".to_string(), 2, None));
        let metrics: SharedMetricsSink = Arc::new(LatestMetricsStore::new());
        let hub = Hub::new(registry.clone(), metrics.clone(), 16);
        GatewayService::new(
            registry,
            token_validator,
            metrics,
            hub,
            GatewayServiceConfig {
                require_authentication,
                async_callbacks: false,
                command_timeout: Duration::from_secs(1),
                outbound_queue_depth: 16,
            },
        )
    }

    #[tokio::test]
    async fn authenticate_rejects_invalid_token() {
        let service = make_service(false);
        let response = service
            .authenticate(Request::new(AuthRequest {
                token: "wrong".to_string(),
                hostname: "host-1".to_string(),
                agent_version: "1.0".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn authenticate_registers_agent_and_returns_level() {
        let service = make_service(false);
        let response = service
            .authenticate(Request::new(AuthRequest {
                token: "agent-token".to_string(),
                hostname: "host-1".to_string(),
                agent_version: "1.0".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert_eq!(response.permission_level, 2);
        assert!(service.registry.get(&response.agent_id).is_some());
    }

    // `run_stream`'s lazy-registration and lifecycle behavior (spec.md §4.F
    // steps 2-6) is exercised end-to-end in tests/scenarios.rs, where a
    // real `Streaming<MetricsStreamRequest>` is obtained by driving the
    // service through an in-process tonic client/server pair rather than
    // hand-constructed here.
}
