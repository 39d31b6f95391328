//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time;

use crate::chat::{ChatError, CloseReason, MessageStream, StreamEvent};
use crate::AppState;

use super::events::{
    ClientMessage, GatewayMessage, HeartbeatPayload, IdentifyPayload, ResumePayload, OP_HEARTBEAT,
    OP_IDENTIFY, OP_JOIN, OP_LEAVE, OP_PUBLISH, OP_RESUME,
};
use super::handler::{
    handle_identify, handle_join, handle_leave, handle_publish, handle_resume,
    HEARTBEAT_INTERVAL_MS,
};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Close codes (4000-range for application-level).
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
pub const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_BACKPRESSURE: u16 = 4008;
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;
/// Standard close codes for hub-initiated endings.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Timeout for receiving IDENTIFY/RESUME after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// The initial opcode parsed from the client's first message.
enum InitialOp {
    Identify(IdentifyPayload),
    Resume(ResumePayload),
}

/// How the handshake ended when it did not produce an [`InitialOp`].
struct HandshakeFailure {
    code: u16,
    reason: &'static str,
}

impl HandshakeFailure {
    fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY or RESUME within timeout.
    let initial = time::timeout(
        Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
        read_initial_op(&mut ws_rx),
    )
    .await;

    let initial_op = match initial {
        Ok(Ok(op)) => op,
        Ok(Err(failure)) => {
            tracing::debug!(reason = failure.reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, failure.code, failure.reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Open the session and send READY, or replay for RESUME.
    let opened = match initial_op {
        InitialOp::Identify(payload) => handle_identify(&state, payload)
            .await
            .map(|(session_id, ready)| (session_id, vec![ready])),
        InitialOp::Resume(payload) => handle_resume(&state, payload).await,
    };

    let (session_id, frames) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::debug!(code = e.code(), "gateway handshake rejected");
            let code = match e {
                ChatError::Auth(_) => CLOSE_AUTH_FAILED,
                _ => {
                    let _ = send(&mut ws_tx, &GatewayMessage::error(&e, None)).await;
                    CLOSE_UNKNOWN_ERROR
                }
            };
            let _ = send_close(&mut ws_tx, code, e.code()).await;
            return;
        }
    };

    let stream = match state.hub.on_message(&session_id) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, e.code()).await;
            let _ = state.hub.disconnect(&session_id);
            return;
        }
    };

    tracing::info!(
        session_id = %session_id,
        replayed = frames.len().saturating_sub(1),
        "gateway session established"
    );

    let mut delivered = true;
    for frame in &frames {
        if send(&mut ws_tx, frame).await.is_err() {
            delivered = false;
            break;
        }
    }

    // Step 3: Run the main event loop.
    if delivered {
        run_session(&state, &session_id, stream, ws_tx, ws_rx).await;
    }

    let _ = state.hub.disconnect(&session_id);
    tracing::info!(session_id = %session_id, "gateway session ended");
}

async fn read_initial_op(ws_rx: &mut WsStream) -> Result<InitialOp, HandshakeFailure> {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(?e, "ws read error during identify");
                return Err(HandshakeFailure::new(CLOSE_UNKNOWN_ERROR, "read error"));
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                return Err(HandshakeFailure::new(CLOSE_UNKNOWN_ERROR, "client closed"))
            }
            _ => continue,
        };

        let client_msg: ClientMessage = serde_json::from_str(&text)
            .map_err(|_| HandshakeFailure::new(CLOSE_UNKNOWN_ERROR, "Invalid JSON"))?;

        return match client_msg.op {
            OP_IDENTIFY => serde_json::from_value(client_msg.d)
                .map(InitialOp::Identify)
                .map_err(|_| HandshakeFailure::new(CLOSE_AUTH_FAILED, "invalid identify payload")),
            OP_RESUME => serde_json::from_value(client_msg.d)
                .map(InitialOp::Resume)
                .map_err(|_| HandshakeFailure::new(CLOSE_AUTH_FAILED, "invalid resume payload")),
            _ => Err(HandshakeFailure::new(
                CLOSE_NOT_AUTHENTICATED,
                "Expected IDENTIFY or RESUME",
            )),
        };
    }
    Err(HandshakeFailure::new(
        CLOSE_UNKNOWN_ERROR,
        "connection closed before identify",
    ))
}

/// Main session event loop: read client messages, forward deliveries,
/// enforce heartbeat.
async fn run_session(
    state: &AppState,
    session_id: &str,
    mut stream: MessageStream,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session_id, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                        break;
                    }
                };

                let reply = match client_msg.op {
                    OP_HEARTBEAT => {
                        got_heartbeat = true;
                        let payload: HeartbeatPayload =
                            serde_json::from_value(client_msg.d).unwrap_or_default();
                        GatewayMessage::heartbeat_ack(payload.seq)
                    }
                    OP_JOIN => handle_join(&state.hub, session_id, client_msg.d),
                    OP_LEAVE => handle_leave(&state.hub, session_id),
                    OP_PUBLISH => handle_publish(&state.hub, session_id, client_msg.d),
                    OP_IDENTIFY | OP_RESUME => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                        break;
                    }
                    _ => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                        break;
                    }
                };

                if send(&mut ws_tx, &reply).await.is_err() {
                    break;
                }
            }

            // Live delivery for the session's room.
            event = stream.next() => {
                match event {
                    Some(StreamEvent::Message(message)) => {
                        let msg = GatewayMessage::message_create(&message);
                        if send(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    Some(StreamEvent::Closed(reason)) => {
                        close_for(&mut ws_tx, session_id, reason).await;
                        break;
                    }
                    None => break,
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        session_id = %session_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Tell the client why the hub closed its session.
async fn close_for(ws_tx: &mut WsSink, session_id: &str, reason: CloseReason) {
    let code = match reason {
        CloseReason::BackpressureExceeded => CLOSE_BACKPRESSURE,
        CloseReason::Shutdown => CLOSE_GOING_AWAY,
        CloseReason::Disconnected => {
            let _ = send_close(ws_tx, CLOSE_NORMAL, reason.as_str()).await;
            return;
        }
    };

    tracing::debug!(session_id = %session_id, %reason, "closing evicted session");
    let _ = send(ws_tx, &GatewayMessage::reconnect(reason.as_str())).await;
    let _ = send_close(ws_tx, code, reason.as_str()).await;
}

async fn send(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    ws_tx.send(Message::Text(msg.to_json().into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
