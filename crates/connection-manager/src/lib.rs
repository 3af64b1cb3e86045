//! Realtime connections for the offline sync daemon.
//!
//! This crate provides:
//! - ConnectionManager: several multiplexed realtime connections, each with
//!   per-topic subscriptions and its own reconnect supervisor
//! - Automatic reconnection with exponential backoff and a bounded attempt count
//! - Resubscription of every active topic before sends resume
//! - Fallback to the message queue when a connection is not live
//! - WebSocket and in-memory transport connectors
//!
//! Each frame is delivered at most once by the transport. A message that was
//! queued and later resent after a reconnect keeps its `message_id`, so
//! receivers are expected to drop duplicates by id.

mod connection;
mod error;
mod manager;
mod messages;
mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState, TopicCallback};
pub use error::{ConnectionError, ConnectionResult};
pub use manager::{ConnectionManager, ConnectionTransport, SendOutcome, DEFAULT_MAX_CONNECTIONS};
pub use messages::{TopicEvent, WireMessage};
pub use transport::{
    MemoryConnector, ServerSession, TransportConnector, TransportEvent, TransportLink,
    WebSocketConnector,
};
