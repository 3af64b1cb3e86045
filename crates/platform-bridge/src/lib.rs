//! Platform bridge for the offline sync daemon.
//!
//! This crate provides:
//! - Typed message payloads and the outbound message transport seam
//! - Resource kinds, record validation, and the remote CRUD seam
//! - Durable key-value storage (SQLite and in-memory)
//! - An HTTP client implementing both remote seams

mod error;
mod http;
mod payload;
mod resource;
mod sqlite;
mod store;

pub use error::{BridgeError, BridgeResult};
pub use http::HttpBridgeClient;
pub use payload::{
    MessagePayload, MessageTransport, OutboundMessage, SendReceipt, MAX_TEXT_LENGTH,
};
pub use resource::{Record, ResourceApi, ResourceType};
pub use sqlite::SqliteStore;
pub use store::{KeyValueStore, MemoryStore};
