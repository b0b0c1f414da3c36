//! Chatsync core library: realtime state reconciliation for an agent chat
//! client. Server-sent events are buffered, merged into a query cache by pure
//! reconcilers, and projected into per-session status.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod init;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod transport;
