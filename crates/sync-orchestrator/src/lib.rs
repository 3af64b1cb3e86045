//! Background loops and cross-component wiring for offline sync.
//!
//! This crate provides:
//! - SyncOrchestrator: starts the network monitor and both queue loops,
//!   reacts to network transitions and connection lifecycle events
//! - Mapping from the daemon `Config` sections onto component configs
//!
//! A transition from offline to any reachable status requests one drain of
//! the message queue, one sync queue pass, and an immediate reconnect of
//! every connection waiting out its backoff. A connection coming up only
//! requests another drain while messages are still pending and no drain is
//! running, so the reconnect a transition causes does not drain twice.

mod error;
mod orchestrator;
mod settings;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{OrchestratorStatus, SyncOrchestrator};
pub use settings::{
    connection_config, http_probes, message_queue_config, monitor_config, sync_queue_config,
};
