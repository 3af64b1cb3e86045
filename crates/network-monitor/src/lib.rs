//! Connectivity and network quality detection.
//!
//! This crate provides:
//! - Parallel reachability probes (HTTP and TCP) with a per-probe timeout
//! - Status classification: online, slow, unstable, offline
//! - Transition-only listener notification and a `watch` snapshot channel
//! - A periodic check loop with on-demand checks in between

mod error;
mod monitor;
mod probe;
mod status;

pub use error::{NetworkError, NetworkResult};
pub use monitor::{ListenerHandle, MonitorConfig, NetworkMonitor};
pub use probe::{HttpProbe, Probe, TcpProbe};
pub use status::{NetworkInfo, NetworkStatus};
