//! The distribution core's public face.
//!
//! `ChatHub` owns the store, the room registry and every live session, and
//! exposes the transport-agnostic operations the gateway and REST routes
//! are built on.

use std::sync::Arc;

use dashmap::DashMap;
use huddle_common::PrefixedId;

use crate::auth::{Authenticator, Identity};
use crate::config::Config;

use super::broadcast::Broadcaster;
use super::error::{ChatError, CloseReason};
use super::message::{Backfill, Message};
use super::rooms::{validate_room_id, RoomRegistry, RoomSummary};
use super::session::{CloseOutcome, MessageStream, Session, SessionState, Transition};
use super::store::MessageStore;

/// Result of joining (or resuming into) a room.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: String,
    /// Messages the session must see before anything from its stream.
    pub backfill: Backfill,
    /// Room head at join time. The stream starts after this sequence.
    pub last_sequence: u64,
}

pub struct ChatHub {
    authenticator: Arc<dyn Authenticator>,
    store: Arc<MessageStore>,
    rooms: Arc<RoomRegistry>,
    broadcaster: Broadcaster,
    sessions: DashMap<String, Arc<Session>>,
    queue_capacity: usize,
}

impl ChatHub {
    pub fn new(authenticator: Arc<dyn Authenticator>, config: &Config) -> Self {
        let store = Arc::new(MessageStore::new(config.history_capacity));
        let rooms = Arc::new(RoomRegistry::new());
        let broadcaster =
            Broadcaster::new(store.clone(), rooms.clone(), config.max_message_length);

        Self {
            authenticator,
            store,
            rooms,
            broadcaster,
            sessions: DashMap::new(),
            queue_capacity: config.session_queue_capacity.max(1),
        }
    }

    /// Verify a credential and open a session for it.
    pub async fn connect(&self, token: &str) -> Result<String, ChatError> {
        let identity = match self.authenticator.verify(token).await {
            Ok(identity) => identity,
            Err(e) => {
                let state = SessionState::Connecting.apply(Transition::Reject);
                tracing::debug!(reason = %e, ?state, "connection rejected");
                return Err(e.into());
            }
        };

        let session_id = Session::generate();
        let session = Session::new(session_id.clone(), identity, self.queue_capacity);
        tracing::info!(
            session_id = %session_id,
            user_id = %session.identity.user_id,
            "session established"
        );
        self.sessions.insert(session_id.clone(), Arc::new(session));
        Ok(session_id)
    }

    /// Look up a live session. Closed sessions are reported once and then
    /// forgotten.
    pub fn session(&self, session_id: &str) -> Result<Arc<Session>, ChatError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or(ChatError::UnknownSession)?;

        if let Err(e) = session.ensure_open() {
            self.sessions.remove(session_id);
            return Err(e);
        }
        Ok(session)
    }

    /// Join `room_id`, leaving the current room first if there is one.
    ///
    /// `since` is the last sequence the client already has. The backfill is
    /// computed and the session registered under the room's append lock, so
    /// every later message reaches the session through its stream and none
    /// reaches it twice.
    pub fn join_room(
        &self,
        session_id: &str,
        room_id: &str,
        since: Option<u64>,
    ) -> Result<JoinOutcome, ChatError> {
        validate_room_id(room_id)?;
        let session = self.session(session_id)?;

        let (backfill, last_sequence, displaced) = self.store.with_room(room_id, |log| {
            let backfill = log.backfill(since);
            let head = log.head();
            let (handle, displaced) = session.enter_room(room_id, head)?;
            self.rooms.join(room_id, handle);
            Ok::<_, ChatError>((backfill, head, displaced))
        })?;

        if let Some(previous) = displaced.filter(|previous| previous != room_id) {
            self.rooms.leave(&previous, session_id);
        }

        // Evicted by a publish in the previous room while switching.
        if let Err(e) = session.ensure_open() {
            self.rooms.leave(room_id, session_id);
            return Err(e);
        }

        tracing::debug!(
            session_id = %session_id,
            room_id = %room_id,
            backfill = backfill.messages.len(),
            gap = backfill.gap.is_some(),
            last_sequence,
            "session joined room"
        );

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            backfill,
            last_sequence,
        })
    }

    /// Publish to the session's current room.
    pub fn publish(&self, session_id: &str, text: &str) -> Result<Arc<Message>, ChatError> {
        let session = self.session(session_id)?;
        let room_id = session.room_id().ok_or(ChatError::NotJoined)?;
        self.broadcaster.publish(&room_id, &session.identity, text)
    }

    /// Publish on behalf of an identity that holds no session.
    pub fn publish_as(
        &self,
        identity: &Identity,
        room_id: &str,
        text: &str,
    ) -> Result<Arc<Message>, ChatError> {
        validate_room_id(room_id)?;
        self.broadcaster.publish(room_id, identity, text)
    }

    /// The session's live stream. Can be taken once.
    pub fn on_message(&self, session_id: &str) -> Result<MessageStream, ChatError> {
        self.session(session_id)?.take_stream()
    }

    /// Leave the current room. The session stays open and may join again.
    pub fn leave_room(&self, session_id: &str) -> Result<String, ChatError> {
        let session = self.session(session_id)?;
        let room_id = session.exit_room().ok_or(ChatError::NotJoined)?;
        self.rooms.leave(&room_id, session_id);

        tracing::debug!(session_id = %session_id, room_id = %room_id, "session left room");
        Ok(room_id)
    }

    /// Close the session and forget it. Queued deliveries are dropped.
    pub fn disconnect(&self, session_id: &str) -> Result<(), ChatError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or(ChatError::UnknownSession)?;

        self.end(&session, CloseReason::Disconnected);
        Ok(())
    }

    /// Retained messages for a room, without joining it.
    pub fn history(&self, room_id: &str, since: Option<u64>) -> Result<Backfill, ChatError> {
        validate_room_id(room_id)?;
        Ok(self.store.backfill(room_id, since))
    }

    /// Rooms that currently have members.
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .rooms()
            .into_iter()
            .map(|(room_id, member_count)| RoomSummary {
                last_sequence: self.store.head(&room_id),
                room_id,
                member_count,
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session with [`CloseReason::Shutdown`].
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        for session in &sessions {
            self.end(session, CloseReason::Shutdown);
        }
        tracing::info!(sessions = sessions.len(), "chat hub shut down");
        sessions.len()
    }

    fn end(&self, session: &Session, reason: CloseReason) {
        let closed = match session.close(reason) {
            CloseOutcome::Closed { room_id } => {
                if let Some(room_id) = room_id {
                    self.rooms.leave(&room_id, &session.session_id);
                }
                true
            }
            CloseOutcome::AlreadyClosed => false,
        };

        let reason = session.close_reason().unwrap_or(reason);
        tracing::info!(
            session_id = %session.session_id,
            user_id = %session.identity.user_id,
            %reason,
            already_closed = !closed,
            "session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use async_trait::async_trait;
    use huddle_common::id::{has_prefix, prefix};

    /// Accepts any non-empty token as the user of that name.
    struct NamedTokens;

    #[async_trait]
    impl Authenticator for NamedTokens {
        async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            match token {
                "" => Err(AuthError::MissingToken),
                "expired" => Err(AuthError::Expired),
                name => Ok(Identity::new(format!("usr_{name}"), name)),
            }
        }
    }

    fn hub(history_capacity: usize) -> ChatHub {
        let config = Config {
            jwt_secret: "unused".into(),
            jwt_issuer: None,
            port: 0,
            history_capacity,
            session_queue_capacity: 16,
            max_message_length: 100,
        };
        ChatHub::new(Arc::new(NamedTokens), &config)
    }

    #[tokio::test]
    async fn connect_issues_prefixed_session_ids() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        assert!(has_prefix(&id, prefix::SESSION));
        assert_eq!(hub.session(&id).unwrap().identity.display_name, "alice");
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_create_no_session() {
        let hub = hub(10);
        assert_eq!(
            hub.connect("").await,
            Err(ChatError::Auth(AuthError::MissingToken))
        );
        assert_eq!(
            hub.connect("expired").await,
            Err(ChatError::Auth(AuthError::Expired))
        );
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn invalid_room_ids_are_rejected() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        assert_eq!(
            hub.join_room(&id, "no spaces", None).err(),
            Some(ChatError::InvalidRoom)
        );
        assert_eq!(hub.history("", None).err(), Some(ChatError::InvalidRoom));
    }

    #[tokio::test]
    async fn rejoining_same_room_keeps_membership() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        hub.join_room(&id, "general", None).unwrap();
        hub.join_room(&id, "general", None).unwrap();

        assert_eq!(hub.rooms().len(), 1);
        assert_eq!(hub.rooms()[0].member_count, 1);
    }

    #[tokio::test]
    async fn leave_room_returns_to_authenticated() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        assert_eq!(hub.leave_room(&id), Err(ChatError::NotJoined));

        hub.join_room(&id, "general", None).unwrap();
        assert_eq!(hub.leave_room(&id).unwrap(), "general");

        let session = hub.session(&id).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(hub.rooms().is_empty());
        assert_eq!(hub.publish(&id, "hello"), Err(ChatError::NotJoined));
    }

    #[tokio::test]
    async fn rooms_report_head_sequence() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        hub.join_room(&id, "general", None).unwrap();
        hub.publish(&id, "one").unwrap();
        hub.publish(&id, "two").unwrap();

        assert_eq!(
            hub.rooms(),
            vec![RoomSummary {
                room_id: "general".into(),
                member_count: 1,
                last_sequence: 2,
            }]
        );
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let hub = hub(10);
        let id = hub.connect("alice").await.unwrap();
        hub.join_room(&id, "general", None).unwrap();

        hub.disconnect(&id).unwrap();
        assert!(hub.rooms().is_empty());
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.disconnect(&id), Err(ChatError::UnknownSession));
        assert_eq!(hub.publish(&id, "hi").err(), Some(ChatError::UnknownSession));
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let hub = hub(10);
        let a = hub.connect("alice").await.unwrap();
        let b = hub.connect("bob").await.unwrap();
        hub.join_room(&a, "general", None).unwrap();
        let mut stream = hub.on_message(&b).unwrap();

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(hub.session_count(), 0);
        assert!(hub.rooms().is_empty());
        assert_eq!(
            stream.next().await,
            Some(crate::chat::StreamEvent::Closed(CloseReason::Shutdown))
        );
    }
}
