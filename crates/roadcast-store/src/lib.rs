//! Durable storage and store-and-forward for the Roadcast edge agent
//!
//! Three storage concerns live here: the checksummed blob store for cloud
//! artifacts and collected-data payloads, the per-(campaign, partition)
//! record streams with durable read cursors, and the background forwarder
//! that drains eligible streams through the rate limiter into the uplink.

pub mod forwarder;
pub mod persist;
pub mod ratelimit;
pub mod stream;

pub use forwarder::{Source, StreamForwarder};
pub use persist::{CacheAndPersist, DataType, PersistenceError};
pub use ratelimit::RateLimiter;
pub use stream::{RecordMetadata, StreamError, StreamManager};
