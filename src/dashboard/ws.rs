//! Axum WebSocket upgrade handler for dashboard subscribers (spec.md
//! §4.H, §6).
//!
//! Grounded on `iwismer-rusty-timer`'s `ws_forwarder.rs`: bearer-token
//! auth before upgrade, a `tokio::select!` loop combining socket reads
//! with an outbound queue and a ping ticker.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::collaborators::SharedTokenValidator;
use crate::dashboard::hub::Hub;
use crate::dashboard::subscriber::Frame;

const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(45);

#[derive(Clone)]
pub struct DashboardState {
    pub hub: Arc<Hub>,
    pub token_validator: SharedTokenValidator,
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: String,
}

pub async fn upgrade_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let level = state.token_validator.validate_agent_token(&params.token).await;
    let Some(_level) = level else {
        warn!("dashboard subscriber rejected: invalid token");
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: DashboardState, token: String) {
    let user_id = token_as_user_id(&token);
    let (subscriber, mut outbound_rx) = state.hub.add_subscriber(user_id.clone(), user_id.clone());
    let subscriber_id = subscriber.id;

    let (mut sink, mut stream) = socket.split();

    let writer_subscriber = subscriber.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(TRANSPORT_PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Ping(Default::default())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            if writer_subscriber.is_terminal() {
                break;
            }
        }
    });

    let reader_subscriber = subscriber.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(_) => break,
            };
            match message {
                Message::Text(text) => handle_client_message(&reader_subscriber, &text.to_string()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let _ = tokio::join!(writer, reader);
    state.hub.remove_subscriber(subscriber_id);
    debug!(subscriber_id, "dashboard subscriber disconnected");
}

fn handle_client_message(subscriber: &crate::dashboard::subscriber::Subscriber, text: &str) {
    #[derive(Deserialize)]
    struct ClientMessage {
        #[serde(rename = "type")]
        kind: String,
        data: Option<String>,
    }

    let Ok(parsed) = serde_json::from_str::<ClientMessage>(text) else {
        return;
    };

    match parsed.kind.as_str() {
        "subscribe" => {
            if let Some(agent_id) = parsed.data {
                subscriber.subscribe(agent_id);
            }
        }
        "unsubscribe" => {
            if let Some(agent_id) = parsed.data {
                subscriber.unsubscribe(&agent_id);
            }
        }
        "ping" => subscriber.try_send(Frame::new("pong", serde_json::Value::Null)),
        _ => {}
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into())))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())
}

fn token_as_user_id(token: &str) -> String {
    crate::sanitize::sanitize_string(token.get(..8.min(token.len())).unwrap_or("unknown"))
}
