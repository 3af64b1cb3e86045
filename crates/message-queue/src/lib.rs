//! Persistent, priority-ordered queue of outbound chat messages.
//!
//! This crate provides:
//! - MessageQueue: durable queue with bounded retry and a sent-item retention window
//! - Non-reentrant drain passes, skipped while the network is offline
//! - A background loop draining on demand and on a fixed interval
//!
//! Delivery is at-least-once: a message whose send succeeded remotely but
//! whose acknowledgement was lost is sent again under the same id.

mod error;
mod message;
mod queue;

pub use error::{QueueError, QueueResult};
pub use message::{MessageStatus, Priority, QueuedMessage};
pub use queue::{
    DrainOutcome, DrainReport, MessageQueue, MessageQueueConfig, QueueStats, SkipReason,
};
