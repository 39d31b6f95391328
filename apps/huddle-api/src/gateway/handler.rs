//! Incoming opcode dispatch onto the chat hub.
//!
//! Handlers never touch the socket. They return the frames to send, in
//! order, and leave transport concerns to the server loop.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::chat::{ChatError, ChatHub};
use crate::AppState;

use super::events::{
    EventName, GatewayMessage, HistoryGapData, IdentifyPayload, JoinPayload, MessageAckData,
    PublishPayload, ReadyData, ResumePayload, ResumedData, RoomJoinedData, RoomLeftData,
};

/// Heartbeat interval sent to clients in the READY payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// Code sent in `ERROR` when an operation's payload does not parse.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";

/// Process an IDENTIFY opcode. Returns the new session id and READY.
pub async fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<(String, GatewayMessage), ChatError> {
    let session_id = state.hub.connect(&payload.token).await?;
    let session = state.hub.session(&session_id)?;

    let ready = GatewayMessage::dispatch(
        EventName::READY,
        None,
        ReadyData {
            session_id: &session_id,
            user: &session.identity,
            heartbeat_interval: HEARTBEAT_INTERVAL_MS,
        },
    );
    Ok((session_id, ready))
}

/// Process a RESUME opcode: connect, then rejoin the room after `seq`.
///
/// Returns the new session id and the frames to replay: `HISTORY_GAP` if
/// anything was lost, each missed message, then `RESUMED`.
pub async fn handle_resume(
    state: &AppState,
    payload: ResumePayload,
) -> Result<(String, Vec<GatewayMessage>), ChatError> {
    let session_id = state.hub.connect(&payload.token).await?;

    let joined = match state
        .hub
        .join_room(&session_id, &payload.room_id, Some(payload.seq))
    {
        Ok(joined) => joined,
        Err(e) => {
            let _ = state.hub.disconnect(&session_id);
            return Err(e);
        }
    };

    let mut frames = Vec::with_capacity(joined.backfill.messages.len() + 2);
    if let Some(gap) = joined.backfill.gap {
        frames.push(GatewayMessage::dispatch(
            EventName::HISTORY_GAP,
            None,
            HistoryGapData {
                room_id: &joined.room_id,
                requested_after: gap.requested_after,
                resumes_at: gap.resumes_at,
            },
        ));
    }
    frames.extend(
        joined
            .backfill
            .messages
            .iter()
            .map(GatewayMessage::message_create),
    );
    frames.push(GatewayMessage::dispatch(
        EventName::RESUMED,
        None,
        ResumedData {
            session_id: &session_id,
            room_id: &joined.room_id,
            replayed: joined.backfill.messages.len(),
            last_sequence: joined.last_sequence,
        },
    ));

    Ok((session_id, frames))
}

/// Process a JOIN opcode. Replies with ROOM_JOINED or ERROR.
pub fn handle_join(hub: &ChatHub, session_id: &str, data: Value) -> GatewayMessage {
    let payload: JoinPayload = match parse(data) {
        Ok(p) => p,
        Err(reply) => return reply,
    };

    match hub.join_room(session_id, &payload.room_id, payload.since) {
        Ok(joined) => GatewayMessage::dispatch(
            EventName::ROOM_JOINED,
            None,
            RoomJoinedData {
                room_id: &joined.room_id,
                messages: &joined.backfill.messages,
                gap: joined.backfill.gap,
                last_sequence: joined.last_sequence,
            },
        ),
        Err(e) => GatewayMessage::error(&e, None),
    }
}

/// Process a LEAVE opcode. Replies with ROOM_LEFT or ERROR.
pub fn handle_leave(hub: &ChatHub, session_id: &str) -> GatewayMessage {
    match hub.leave_room(session_id) {
        Ok(room_id) => GatewayMessage::dispatch(
            EventName::ROOM_LEFT,
            None,
            RoomLeftData { room_id: &room_id },
        ),
        Err(e) => GatewayMessage::error(&e, None),
    }
}

/// Process a PUBLISH opcode. Replies with MESSAGE_ACK or ERROR; the
/// message itself reaches the sender through its stream like everyone else.
pub fn handle_publish(hub: &ChatHub, session_id: &str, data: Value) -> GatewayMessage {
    let payload: PublishPayload = match parse(data) {
        Ok(p) => p,
        Err(reply) => return reply,
    };

    match hub.publish(session_id, &payload.text) {
        Ok(message) => GatewayMessage::dispatch(
            EventName::MESSAGE_ACK,
            None,
            MessageAckData {
                nonce: payload.nonce,
                sequence: message.sequence,
            },
        ),
        Err(e) => GatewayMessage::error(&e, payload.nonce),
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, GatewayMessage> {
    serde_json::from_value(data).map_err(|e| {
        GatewayMessage::dispatch(
            EventName::ERROR,
            None,
            serde_json::json!({ "code": INVALID_PAYLOAD, "message": e.to_string() }),
        )
    })
}
