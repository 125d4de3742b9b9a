//! C1 (upstream connection) and C2 (stream multiplexer).
//!
//! Generalizes the teacher's `collector::runner` connect/reconnect loop
//! into a first-class, testable component with an injectable socket
//! factory (design note §9: "make reconnect a first-class, testable
//! operation on C1 with an injectable socket factory").

pub mod connection;
pub mod multiplexer;

pub use connection::{ConnectionState, UpstreamConnection};
pub use multiplexer::StreamMultiplexer;
