//! Message, backfill and gap types shared by the store, the registry and the
//! transports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// A message as stored and delivered. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Message {
    pub room_id: String,
    /// Per-room position, assigned by the store starting at 1.
    pub sequence: u64,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    /// Server wall-clock time at append.
    pub created_at: DateTime<Utc>,
}

/// Messages after a resume point could not all be recovered.
///
/// Everything after `requested_after` and before `resumes_at` is unavailable,
/// either evicted from the window or lost with a restarted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Gap {
    pub requested_after: u64,
    pub resumes_at: u64,
}

/// Retained messages handed to a session before it starts streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct Backfill {
    pub messages: Vec<Message>,
    pub gap: Option<Gap>,
}

impl Backfill {
    pub(crate) fn from_window<'a>(
        window: impl Iterator<Item = &'a Arc<Message>>,
        gap: Option<Gap>,
    ) -> Self {
        Self {
            messages: window.map(|m| Message::clone(m)).collect(),
            gap,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.gap.is_none()
    }
}
