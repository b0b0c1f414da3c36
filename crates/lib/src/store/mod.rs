//! In-memory state shared by the transport, the dispatch loop, and UI readers.
//!
//! - `QueryCache`: session list and per-session message lists, by key
//! - `EventBuffer`: bounded backlog of received, not yet applied events
//! - `StatusProjection`: per-session idle/updating/error flags

mod buffer;
mod cache;
mod status;

pub use buffer::{EventBuffer, QueuedEvent, DEFAULT_MAX_BACKLOG};
pub use cache::{MessageList, QueryCache, QueryKey, SessionList};
pub use status::{SessionStatus, StatusChange, StatusProjection};
