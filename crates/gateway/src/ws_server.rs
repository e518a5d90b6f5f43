//! Downstream WebSocket server.
//!
//! Each connection sends one subscribe frame and then only receives:
//! a `subscribed` confirmation, `quote` frames, and `error` frames.
//! Later inbound frames are not read for subscription changes; closing
//! the connection is the unsubscribe.

use crate::client::{Outbound, SubscriberState};
use crate::error::{GatewayError, Result};
use crate::manager::SessionManager;
use crate::protocol::{ErrorData, ServerMessage, SubscribeRequest};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use common::{ErrorCode, Settings};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared state for the WS routes.
pub struct AppState {
    pub registry: Arc<crate::client::SubscriberRegistry>,
    pub manager: Arc<SessionManager>,
    pub settings: Settings,
}

/// Build the subscriber-facing router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let client = Arc::new(SubscriberState::new(
        state.settings.server.subscriber_buffer_max,
        state.settings.server.overflow_policy,
    ));
    let client_id = state.registry.register(client.clone());
    info!(subscriber = %client_id, "subscriber connected");

    // Writer task: the only place that touches the sink.
    let mut send_task = {
        let client = client.clone();
        tokio::spawn(async move {
            loop {
                match client.next_outbound().await {
                    Outbound::Frame(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Ping => {
                        if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        })
    };

    // Exactly one subscribe frame is read per connection.
    let subscribe_timeout = state.settings.server.subscribe_timeout;
    match timeout(subscribe_timeout, next_text_frame(&mut ws_rx)).await {
        Err(_) => {
            client.send(&ServerMessage::Error(ErrorData::new(
                ErrorCode::Unknown,
                format!(
                    "no subscription payload received within {:.0} seconds",
                    subscribe_timeout.as_secs_f64()
                ),
            )));
            client.push_close();
        }
        Ok(None) => {
            // Disconnected before subscribing.
        }
        Ok(Some(text)) => {
            handle_subscribe(&state, &client, &text).await;
        }
    }

    // Pump until the peer leaves or the writer closes (limit reached,
    // overflow policy, drain).
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Subscription changes mid-connection are not
                        // supported; frames are drained and ignored.
                    }
                    Some(Err(err)) => {
                        debug!(subscriber = %client_id, error = %err, "websocket error");
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
            _ = ping_interval.tick() => client.push_ping(),
        }
    }

    state.manager.release_subscriber(&client_id).await;
    send_task.abort();
    info!(subscriber = %client_id, "subscriber disconnected");
}

async fn next_text_frame(ws_rx: &mut futures::stream::SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Binary(data)) => return Some(String::from_utf8_lossy(&data).to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Decode and validate the one-shot subscribe frame.
fn parse_subscribe_request(text: &str) -> Result<SubscribeRequest> {
    let request: SubscribeRequest = serde_json::from_str(text)?;
    request.validate().map_err(GatewayError::InvalidPayload)?;
    Ok(request)
}

async fn handle_subscribe(state: &Arc<AppState>, client: &Arc<SubscriberState>, text: &str) {
    let request = match parse_subscribe_request(text) {
        Ok(request) => request,
        Err(err) => {
            warn!(subscriber = %client.id, error = %err, "rejected subscribe payload");
            let message = match &err {
                GatewayError::Json(_) => "subscription payload must be a valid JSON object".to_string(),
                other => other.to_string(),
            };
            client.send(&ServerMessage::Error(ErrorData::new(ErrorCode::Unknown, message)));
            return;
        }
    };

    info!(
        subscriber = %client.id,
        exchange = %request.exchange,
        contract_type = ?request.contract_type,
        symbols = ?request.symbols,
        limit = request.limit,
        "subscriber requested feed"
    );

    client.set_limit(request.limit);
    let outcome = state.manager.subscribe(client, &request).await;

    for rejection in &outcome.rejected {
        let mut error = ErrorData::new(rejection.code, rejection.message.clone())
            .with_exchange(request.exchange.clone())
            .with_symbols(rejection.symbols.clone());
        if let Some(contract_type) = &outcome.contract_type {
            error = error.with_contract_type(contract_type.clone());
        }
        client.send(&ServerMessage::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_payload_parses() {
        let request = parse_subscribe_request(
            r#"{"exchange":"binance","contract_type":"spot","symbols":["BTCUSDT"],"limit":3}"#,
        )
        .unwrap();
        assert_eq!(request.exchange, "binance");
        assert_eq!(request.limit, 3);
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = parse_subscribe_request("not json").unwrap_err();
        assert!(matches!(err, GatewayError::Json(_)));
    }

    #[test]
    fn structural_violations_are_invalid_payloads() {
        let err = parse_subscribe_request(r#"{"exchange":"binance","symbols":[]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));

        let err = parse_subscribe_request(r#"{"exchange":"","symbols":["BTCUSDT"]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));
    }
}
