//! Per-connection session state and its outbound delivery stream.

use std::sync::Arc;

use futures_util::Stream;
use huddle_common::id::prefix;
use huddle_common::PrefixedId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::auth::Identity;

use super::error::{ChatError, CloseReason};
use super::message::Message;

/// Lifecycle of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticated,
    Joined,
    Streaming,
    Closed,
}

/// Completed operations that move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Authenticate,
    Reject,
    Join,
    Stream,
    Leave,
    Close,
}

impl SessionState {
    /// The state after `transition`, or `None` if it is not allowed here.
    pub fn apply(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;
        use Transition::*;

        match (self, transition) {
            (Closed, _) => None,
            (_, Close) => Some(Closed),
            (Connecting, Authenticate) => Some(Authenticated),
            (Connecting, Reject) => Some(Closed),
            (Authenticated, Join) => Some(Joined),
            (Joined, Stream) => Some(Streaming),
            (Joined | Streaming, Leave) => Some(Authenticated),
            _ => None,
        }
    }
}

/// Mutable session state shared by the session, its registry handle and
/// its message stream.
struct Cursor {
    state: SessionState,
    room_id: Option<String>,
    /// Bumped on every join and leave; deliveries from older memberships
    /// are discarded.
    epoch: u64,
    last_delivered: u64,
    close_reason: Option<CloseReason>,
}

struct Shared {
    cursor: Mutex<Cursor>,
    closer: watch::Sender<Option<CloseReason>>,
}

/// Result of a close transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The session was open. Carries the room it was in at that moment.
    Closed { room_id: Option<String> },
    AlreadyClosed,
}

impl Shared {
    fn close(&self, reason: CloseReason) -> CloseOutcome {
        let room_id = {
            let mut cursor = self.cursor.lock();
            let Some(state) = cursor.state.apply(Transition::Close) else {
                return CloseOutcome::AlreadyClosed;
            };
            cursor.state = state;
            cursor.close_reason = Some(reason);
            cursor.room_id.take()
        };
        self.closer.send_replace(Some(reason));
        CloseOutcome::Closed { room_id }
    }
}

/// A message queued for one session.
#[derive(Debug, Clone)]
pub struct Delivery {
    epoch: u64,
    message: Arc<Message>,
}

/// Why a delivery could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session's queue is at capacity.
    Full,
    /// The session's stream has been dropped.
    Closed,
}

/// What the room registry holds for each member: enough to queue a
/// delivery or evict the session, nothing more.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    epoch: u64,
    outbound: mpsc::Sender<Delivery>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Queue a message without waiting.
    pub fn deliver(&self, message: &Arc<Message>) -> Result<(), DeliveryError> {
        let delivery = Delivery {
            epoch: self.epoch,
            message: message.clone(),
        };
        self.outbound.try_send(delivery).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Close the session from outside its connection.
    pub fn force_close(&self, reason: CloseReason) -> bool {
        matches!(self.shared.close(reason), CloseOutcome::Closed { .. })
    }

    /// Return the session to `Authenticated` after the registry dropped
    /// this membership. No-op once the session has moved on to a later one.
    pub fn detach(&self) -> bool {
        let mut cursor = self.shared.cursor.lock();
        if cursor.epoch != self.epoch {
            return false;
        }
        let Some(state) = cursor.state.apply(Transition::Leave) else {
            return false;
        };
        cursor.state = state;
        cursor.epoch += 1;
        cursor.room_id = None;
        true
    }
}

/// State for a single authenticated connection.
pub struct Session {
    /// Unique session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    pub identity: Identity,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Delivery>,
    stream: Mutex<Option<MessageStream>>,
}

impl Session {
    /// Create an authenticated session with an outbound queue of
    /// `queue_capacity` deliveries.
    pub fn new(session_id: String, identity: Identity, queue_capacity: usize) -> Self {
        let (outbound, inbound) = mpsc::channel(queue_capacity.max(1));
        let (closer, closed) = watch::channel(None);

        let state = SessionState::Connecting
            .apply(Transition::Authenticate)
            .unwrap_or(SessionState::Authenticated);
        let shared = Arc::new(Shared {
            cursor: Mutex::new(Cursor {
                state,
                room_id: None,
                epoch: 0,
                last_delivered: 0,
                close_reason: None,
            }),
            closer,
        });

        let stream = MessageStream {
            session_id: session_id.clone(),
            shared: shared.clone(),
            inbound,
            closed,
            finished: false,
        };

        Self {
            session_id,
            identity,
            shared,
            outbound,
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.cursor.lock().state
    }

    pub fn room_id(&self) -> Option<String> {
        self.shared.cursor.lock().room_id.clone()
    }

    pub fn last_delivered(&self) -> u64 {
        self.shared.cursor.lock().last_delivered
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.cursor.lock().close_reason
    }

    pub fn ensure_open(&self) -> Result<(), ChatError> {
        match self.close_reason() {
            Some(reason) => Err(ChatError::SessionClosed(reason)),
            None => Ok(()),
        }
    }

    /// Hand out the session's delivery stream. Only the first call succeeds.
    pub fn take_stream(&self) -> Result<MessageStream, ChatError> {
        self.ensure_open()?;
        self.stream.lock().take().ok_or(ChatError::StreamTaken)
    }

    /// Move into `room_id` with everything up to `head` already covered by
    /// the backfill. Must run under the room's append lock so no delivery
    /// can be queued between the backfill snapshot and this call.
    ///
    /// Returns the handle to register and the room this displaced, if any.
    pub(crate) fn enter_room(
        &self,
        room_id: &str,
        head: u64,
    ) -> Result<(SessionHandle, Option<String>), ChatError> {
        let mut cursor = self.shared.cursor.lock();
        if let Some(reason) = cursor.close_reason {
            return Err(ChatError::SessionClosed(reason));
        }

        let mut displaced = None;
        if let Some(state) = cursor.state.apply(Transition::Leave) {
            cursor.state = state;
            displaced = cursor.room_id.take();
        }

        let state = cursor
            .state
            .apply(Transition::Join)
            .and_then(|s| s.apply(Transition::Stream))
            .ok_or(ChatError::SessionClosed(CloseReason::Disconnected))?;

        cursor.state = state;
        cursor.room_id = Some(room_id.to_string());
        cursor.epoch += 1;
        cursor.last_delivered = head;

        let handle = SessionHandle {
            session_id: self.session_id.clone(),
            epoch: cursor.epoch,
            outbound: self.outbound.clone(),
            shared: self.shared.clone(),
        };
        Ok((handle, displaced))
    }

    /// Leave the current room, returning its id.
    pub(crate) fn exit_room(&self) -> Option<String> {
        let mut cursor = self.shared.cursor.lock();
        let state = cursor.state.apply(Transition::Leave)?;
        cursor.state = state;
        cursor.epoch += 1;
        cursor.room_id.take()
    }

    /// Terminal transition. The room is read and cleared under the same
    /// lock as the state change, so a concurrent join cannot slip between.
    pub fn close(&self, reason: CloseReason) -> CloseOutcome {
        self.shared.close(reason)
    }
}

impl PrefixedId for Session {
    const PREFIX: &'static str = prefix::SESSION;
}

/// An item produced by a session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Message(Arc<Message>),
    Closed(CloseReason),
}

/// Live, ordered deliveries for one session, drained by its transport.
///
/// Discards anything at or below the session's last delivered sequence and
/// anything queued for an earlier room membership.
pub struct MessageStream {
    session_id: String,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Delivery>,
    closed: watch::Receiver<Option<CloseReason>>,
    finished: bool,
}

impl MessageStream {
    /// Wait for the next message. Yields `Closed` once when the session
    /// ends, then `None`. Queued deliveries are dropped on close.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        loop {
            let closed = *self.closed.borrow_and_update();
            if let Some(reason) = closed {
                return Some(self.finish(reason));
            }

            tokio::select! {
                biased;

                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return Some(self.finish(CloseReason::Disconnected));
                    }
                }

                delivery = self.inbound.recv() => match delivery {
                    Some(delivery) => {
                        if let Some(message) = self.accept(delivery) {
                            return Some(StreamEvent::Message(message));
                        }
                    }
                    None => {
                        self.finished = true;
                        return None;
                    }
                },
            }
        }
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            let event = stream.next().await?;
            Some((event, stream))
        })
    }

    fn finish(&mut self, reason: CloseReason) -> StreamEvent {
        self.finished = true;
        self.inbound.close();
        StreamEvent::Closed(reason)
    }

    fn accept(&self, delivery: Delivery) -> Option<Arc<Message>> {
        let mut cursor = self.shared.cursor.lock();
        if delivery.epoch != cursor.epoch {
            return None;
        }
        if delivery.message.sequence <= cursor.last_delivered {
            tracing::debug!(
                session_id = %self.session_id,
                sequence = delivery.message.sequence,
                last_delivered = cursor.last_delivered,
                "discarding duplicate delivery"
            );
            return None;
        }
        cursor.last_delivered = delivery.message.sequence;
        Some(delivery.message)
    }
}
