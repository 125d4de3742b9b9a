//! C5: durable pub/sub publisher. Batches, serializes, compresses, and
//! retries outbound records on behalf of every channel registered with
//! the data-flow manager as the `durable` target (spec §4.4, §4.5).

pub mod batch;
pub mod compression;
pub mod flow_control;
pub mod pool;
pub mod redis_publisher;
pub mod retry;
pub mod serializer;

pub use redis_publisher::RedisPublisher;
pub use serializer::{Envelope, MessageHeader, Serializer, TopicRouter};
