//! Durable event ledger boundary.
//!
//! Defines the store contract used by ingestion, authentication and the
//! reconciliation sweep, plus in-memory and Postgres implementations.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoreKeyLookup};
