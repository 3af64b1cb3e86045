//! Persistent queue of record mutations with conflict detection.
//!
//! This crate provides:
//! - SyncQueue: FIFO create/update/delete operations applied through the
//!   platform CRUD API, with bounded retry
//! - ConflictResolver: field-level diff of local and remote copies
//! - Explicit conflict resolution (keep local, keep remote, or merge)
//!
//! Divergent records are never overwritten automatically. A remote conflict
//! pauses the item until [`SyncQueue::resolve_conflict`] is called.

mod conflict;
mod error;
mod item;
mod queue;

pub use conflict::{ConflictResolver, Resolution, SyncConflict};
pub use error::{SyncError, SyncResult};
pub use item::{SyncItem, SyncOperation, SyncStatus};
pub use queue::{ProcessOutcome, ProcessReport, SkipReason, SyncQueue, SyncQueueConfig, SyncStats};
