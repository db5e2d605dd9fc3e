use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use fleet_common::Frame;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::AppState;
use super::plugins::{Connection, ConnectionId, Delivery, Handshake, Mailbox, PluginHandle};
use crate::errors::RealtimeError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Upgrade handlers ─────────────────────────────────────────────────

/// `/devices?token=..&deviceId=..`
pub async fn devices_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let plugin = state.devices.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, plugin, handshake))
}

/// `/clients?token=..`
pub async fn clients_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let plugin = state.clients.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, plugin, handshake))
}

async fn handle_socket(socket: WebSocket, plugin: PluginHandle, handshake: Handshake) {
    let (connection, mailbox) = Connection::new();
    let id = connection.id().clone();
    if let Err(e) = plugin.connect(connection, handshake) {
        warn!(namespace = plugin.name(), "{}", e);
        return;
    }

    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, mailbox, &plugin, &id).await;

    // Unknown or already-closed ids are ignored by the plugin host.
    let _ = plugin.disconnect(id);
}

/// Parse one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Frame, RealtimeError> {
    serde_json::from_str(text).map_err(|source| RealtimeError::MalformedPayload {
        event: "frame".to_string(),
        source,
    })
}

fn encode_frame(frame: &Frame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(event = %frame.event, "failed to serialize frame: {}", e);
            None
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards what the plugin queued for this connection, hands inbound text
/// frames to the plugin in arrival order, and pings the peer periodically.
/// Exits when the plugin asks for a close, the peer goes away, or no Pong
/// arrives within [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut mailbox: Mailbox,
    plugin: &PluginHandle,
    id: &ConnectionId,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(namespace = plugin.name(), connection = %id, "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Plugin → peer ───────────────────────────────────────
            delivery = mailbox.recv() => {
                match delivery {
                    Delivery::Frame(frame) => {
                        let Some(message) = encode_frame(&frame) else { continue };
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Delivery::Close => break,
                }
            }

            // ── Peer → plugin ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                        Ok(frame) => {
                            if plugin.message(id.clone(), frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(namespace = plugin.name(), connection = %id, "{}", e);
                            if let Some(reply) = encode_frame(&Frame::error(e.to_string()))
                                && sender.send(reply).await.is_err()
                            {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames carry nothing for the plugins.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame() {
        let frame = decode_frame(r#"{"event":"page-change","data":2}"#).unwrap();
        assert_eq!(frame.event, "page-change");
        assert_eq!(frame.data, serde_json::json!(2));
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        let err = decode_frame("not json").unwrap_err();
        assert!(matches!(err, RealtimeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_decode_frame_requires_event() {
        assert!(decode_frame(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn test_encode_frame_is_text() {
        let message = encode_frame(&Frame::error("boom")).unwrap();
        match message {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value["event"], "error");
                assert_eq!(value["data"]["message"], "boom");
            }
            other => panic!("expected text, got {:?}", other),
        }
    }
}
