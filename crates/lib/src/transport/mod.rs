//! Server-sent event transport.
//!
//! Opens `GET {server}/event`, decodes frames, and appends events to the
//! backlog in arrival order. A bad frame is skipped; a failed connection is
//! reported through `ConnectionState` and left for the owner to reconnect.

mod connection;
mod sse;

pub use connection::{ConnectionState, EventTransport, TransportError};
pub use sse::SseDecoder;
