//! Bounded per-room message logs.
//!
//! Each room's log sits behind its own mutex. Appends to one room are
//! serialized through that mutex and define the room's total order; rooms
//! never contend with each other.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::auth::Identity;

use super::message::{Backfill, Gap, Message};

/// Retained history for a single room.
pub struct RoomLog {
    room_id: String,
    capacity: usize,
    next_sequence: u64,
    messages: VecDeque<Arc<Message>>,
}

impl RoomLog {
    fn new(room_id: &str, capacity: usize) -> Self {
        Self {
            room_id: room_id.to_string(),
            capacity,
            next_sequence: 1,
            messages: VecDeque::with_capacity(capacity),
        }
    }

    /// Stamp, sequence and store a message, evicting the oldest on overflow.
    pub fn append(&mut self, sender: &Identity, text: String) -> Arc<Message> {
        let message = Arc::new(Message {
            room_id: self.room_id.clone(),
            sequence: self.next_sequence,
            sender_id: sender.user_id.clone(),
            sender_name: sender.display_name.clone(),
            text,
            created_at: Utc::now(),
        });
        self.next_sequence += 1;

        self.messages.push_back(message.clone());
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
        message
    }

    /// Retained messages with `sequence > since`, or the whole window.
    ///
    /// A gap is reported when `since` is older than the window, or newer
    /// than anything this log has assigned (the client's numbering predates
    /// a restart).
    pub fn backfill(&self, since: Option<u64>) -> Backfill {
        let head = self.head();
        let resumes_at = self.oldest().unwrap_or(head + 1);

        let Some(since) = since else {
            return Backfill::from_window(self.messages.iter(), None);
        };

        if since > head {
            return Backfill::from_window(
                self.messages.iter(),
                Some(Gap {
                    requested_after: since,
                    resumes_at,
                }),
            );
        }

        let gap = (since + 1 < resumes_at).then_some(Gap {
            requested_after: since,
            resumes_at,
        });
        let window = self.messages.iter().skip_while(|m| m.sequence <= since);
        Backfill::from_window(window, gap)
    }

    /// Sequence of the newest message ever appended, 0 if none.
    pub fn head(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Sequence of the oldest retained message.
    pub fn oldest(&self) -> Option<u64> {
        self.messages.front().map(|m| m.sequence)
    }
}

/// All room logs, created on first use and kept for the life of the process.
pub struct MessageStore {
    capacity: usize,
    logs: DashMap<String, Arc<Mutex<RoomLog>>>,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            logs: DashMap::new(),
        }
    }

    fn log(&self, room_id: &str) -> Arc<Mutex<RoomLog>> {
        if let Some(log) = self.logs.get(room_id) {
            return log.value().clone();
        }
        self.logs
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RoomLog::new(room_id, self.capacity))))
            .value()
            .clone()
    }

    /// Run `f` while holding the room's append lock.
    ///
    /// Anything done inside `f` is ordered against every append to the room.
    pub fn with_room<R>(&self, room_id: &str, f: impl FnOnce(&mut RoomLog) -> R) -> R {
        let log = self.log(room_id);
        let mut guard = log.lock();
        f(&mut guard)
    }

    pub fn append(&self, room_id: &str, sender: &Identity, text: String) -> Arc<Message> {
        self.with_room(room_id, |log| log.append(sender, text))
    }

    /// Backfill without creating a log for rooms nobody has used yet.
    pub fn backfill(&self, room_id: &str, since: Option<u64>) -> Backfill {
        let Some(log) = self.existing(room_id) else {
            return RoomLog::new(room_id, self.capacity).backfill(since);
        };
        let backfill = log.lock().backfill(since);
        backfill
    }

    pub fn head(&self, room_id: &str) -> u64 {
        let Some(log) = self.existing(room_id) else {
            return 0;
        };
        let head = log.lock().head();
        head
    }

    fn existing(&self, room_id: &str) -> Option<Arc<Mutex<RoomLog>>> {
        self.logs.get(room_id).map(|log| log.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("usr_alice", "Alice")
    }

    fn sequences(backfill: &Backfill) -> Vec<u64> {
        backfill.messages.iter().map(|m| m.sequence).collect()
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let store = MessageStore::new(10);
        let a = store.append("general", &alice(), "one".into());
        let b = store.append("general", &alice(), "two".into());
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(b.sender_name, "Alice");
        assert_eq!(b.room_id, "general");
        assert!(b.created_at >= a.created_at);
        assert_eq!(store.head("general"), 2);
    }

    #[test]
    fn rooms_number_independently() {
        let store = MessageStore::new(10);
        store.append("a", &alice(), "x".into());
        store.append("a", &alice(), "y".into());
        let first_in_b = store.append("b", &alice(), "z".into());
        assert_eq!(first_in_b.sequence, 1);
        assert_eq!(store.head("a"), 2);
    }

    #[test]
    fn overflow_evicts_oldest_and_keeps_order() {
        let store = MessageStore::new(3);
        for i in 1..=5 {
            store.append("general", &alice(), format!("m{i}"));
        }
        let backfill = store.backfill("general", None);
        assert_eq!(sequences(&backfill), vec![3, 4, 5]);
        assert_eq!(backfill.messages[0].text, "m3");
        assert!(backfill.is_complete());
        assert_eq!(store.head("general"), 5);
    }

    #[test]
    fn backfill_since_returns_only_newer() {
        let store = MessageStore::new(10);
        for i in 1..=4 {
            store.append("general", &alice(), format!("m{i}"));
        }
        let backfill = store.backfill("general", Some(2));
        assert_eq!(sequences(&backfill), vec![3, 4]);
        assert!(backfill.is_complete());

        let caught_up = store.backfill("general", Some(4));
        assert!(caught_up.messages.is_empty());
        assert!(caught_up.is_complete());
    }

    #[test]
    fn resume_from_evicted_sequence_reports_gap() {
        let store = MessageStore::new(2);
        for i in 1..=3 {
            store.append("general", &alice(), format!("m{i}"));
        }

        let backfill = store.backfill("general", Some(0));
        assert_eq!(sequences(&backfill), vec![2, 3]);
        assert_eq!(
            backfill.gap,
            Some(Gap {
                requested_after: 0,
                resumes_at: 2
            })
        );

        // Right at the window edge nothing is missing.
        let edge = store.backfill("general", Some(1));
        assert_eq!(sequences(&edge), vec![2, 3]);
        assert!(edge.is_complete());
    }

    #[test]
    fn fresh_join_never_reports_gap() {
        let store = MessageStore::new(2);
        for i in 1..=5 {
            store.append("general", &alice(), format!("m{i}"));
        }
        let backfill = store.backfill("general", None);
        assert_eq!(sequences(&backfill), vec![4, 5]);
        assert!(backfill.is_complete());
    }

    #[test]
    fn resume_ahead_of_head_reports_gap_with_full_window() {
        let store = MessageStore::new(5);
        store.append("general", &alice(), "only".into());

        let backfill = store.backfill("general", Some(40));
        assert_eq!(sequences(&backfill), vec![1]);
        assert_eq!(
            backfill.gap,
            Some(Gap {
                requested_after: 40,
                resumes_at: 1
            })
        );
    }

    #[test]
    fn unknown_room_backfill_is_empty_and_not_created() {
        let store = MessageStore::new(5);
        let backfill = store.backfill("nowhere", None);
        assert!(backfill.messages.is_empty());
        assert!(backfill.is_complete());
        assert!(store.logs.is_empty());

        let stale = store.backfill("nowhere", Some(3));
        assert_eq!(
            stale.gap,
            Some(Gap {
                requested_after: 3,
                resumes_at: 1
            })
        );
    }

    #[test]
    fn capacity_is_at_least_one() {
        let store = MessageStore::new(0);
        store.append("general", &alice(), "a".into());
        store.append("general", &alice(), "b".into());
        let backfill = store.backfill("general", None);
        assert_eq!(sequences(&backfill), vec![2]);
    }

    #[test]
    fn concurrent_appends_get_distinct_gapless_sequences() {
        let store = Arc::new(MessageStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.append("general", &alice(), format!("t{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let backfill = store.backfill("general", None);
        let seqs = sequences(&backfill);
        assert_eq!(seqs, (1..=400).collect::<Vec<u64>>());
    }
}
