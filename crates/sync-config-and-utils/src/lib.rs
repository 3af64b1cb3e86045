//! Shared configuration, paths, errors, and logging for the offline sync daemon.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    BridgeSettings, Config, MessageQueueSettings, NetworkSettings, RealtimeSettings,
    SyncQueueSettings, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
