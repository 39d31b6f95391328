pub mod broadcast;
pub mod error;
pub mod hub;
pub mod message;
pub mod rooms;
pub mod session;
pub mod store;

pub use error::{ChatError, CloseReason};
pub use hub::{ChatHub, JoinOutcome};
pub use message::{Backfill, Gap, Message};
pub use rooms::RoomSummary;
pub use session::{MessageStream, SessionState, StreamEvent};
