//! Append-then-fan-out publishing.
//!
//! A publish appends under the room's append lock and queues the message to
//! every current member before releasing it, so each member's queue sees the
//! room's messages in sequence order. Queuing never waits: a member whose
//! queue is full is evicted on the spot.

use std::sync::Arc;

use crate::auth::Identity;

use super::error::{ChatError, CloseReason};
use super::message::Message;
use super::rooms::RoomRegistry;
use super::session::DeliveryError;
use super::store::MessageStore;

/// Trim `text` and check it against `max_length` characters.
pub fn validate_text(text: &str, max_length: usize) -> Result<String, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::EmptyText);
    }
    if text.chars().count() > max_length {
        return Err(ChatError::TextTooLong { max: max_length });
    }
    Ok(text.to_string())
}

pub struct Broadcaster {
    store: Arc<MessageStore>,
    rooms: Arc<RoomRegistry>,
    max_length: usize,
}

impl Broadcaster {
    pub fn new(store: Arc<MessageStore>, rooms: Arc<RoomRegistry>, max_length: usize) -> Self {
        Self {
            store,
            rooms,
            max_length,
        }
    }

    /// Validate, sequence, store and fan out a message.
    ///
    /// Returns once the message is stored and queued for every member that
    /// could take it, not once it has been delivered.
    pub fn publish(
        &self,
        room_id: &str,
        sender: &Identity,
        text: &str,
    ) -> Result<Arc<Message>, ChatError> {
        let text = validate_text(text, self.max_length)?;

        let message = self.store.with_room(room_id, |log| {
            let message = log.append(sender, text);
            self.fan_out(&message);
            message
        });

        tracing::debug!(
            room_id = %room_id,
            sequence = message.sequence,
            sender_id = %sender.user_id,
            "message published"
        );
        Ok(message)
    }

    fn fan_out(&self, message: &Arc<Message>) {
        for member in self.rooms.members_of(&message.room_id) {
            match member.deliver(message) {
                Ok(()) => {}
                Err(DeliveryError::Full) => {
                    tracing::warn!(
                        session_id = %member.session_id,
                        room_id = %message.room_id,
                        sequence = message.sequence,
                        "session queue full, evicting"
                    );
                    self.rooms.leave(&message.room_id, &member.session_id);
                    member.force_close(CloseReason::BackpressureExceeded);
                }
                Err(DeliveryError::Closed) => {
                    tracing::debug!(
                        session_id = %member.session_id,
                        room_id = %message.room_id,
                        "delivery to closed queue"
                    );
                    self.rooms.leave(&message.room_id, &member.session_id);
                    member.detach();
                }
            }
        }
    }
}
