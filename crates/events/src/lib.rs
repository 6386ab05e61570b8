//! Event model, request validation/normalization and the queue contract.

pub mod event;
pub mod in_memory_queue;
pub mod normalize;
pub mod queue;
pub mod validation;

pub use event::{
    BatchEventRequest, Event, EventRequest, MAX_BATCH_SIZE, Metadata, MetadataValue,
};
pub use in_memory_queue::InMemoryEventQueue;
pub use normalize::{FormatError, Normalizer, is_normalized_name, normalize_name};
pub use queue::{
    DeadLetter, Delivery, EventQueue, Offset, PartitionId, QueueEntry, QueueError, partition_for,
};
pub use validation::{ValidationError, Validator};
