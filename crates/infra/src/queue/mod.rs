//! Queue backends and consumer cursor persistence.
//!
//! The queue contract and the in-memory queue live in `pulse-events`; this
//! module adds the Redis Streams backend and cursor stores.

pub mod cursor_store;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use cursor_store::{CursorStore, CursorStoreError, InMemoryCursorStore, PostgresCursorStore};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsEventQueue;
