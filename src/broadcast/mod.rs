//! C6: broadcast WebSocket server. Fans canonical records out to
//! subscribed live readers (spec §4.6).

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::ConnectionRecord;
pub use server::{serve, BroadcastChannel, ConnectionPool};
