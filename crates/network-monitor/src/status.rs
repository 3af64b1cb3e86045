//! Network status snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse network quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
    Slow,
    Unstable,
}

impl NetworkStatus {
    /// Whether remote endpoints can be reached at all.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, NetworkStatus::Offline)
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
            NetworkStatus::Slow => "slow",
            NetworkStatus::Unstable => "unstable",
        };
        f.write_str(name)
    }
}

/// Result of the most recent connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    /// Connection kind reported by the platform (wifi, cellular, ...).
    pub connection_type: Option<String>,
    pub speed_mbps: Option<f64>,
    /// Average latency of the successful probes.
    pub latency_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
}

impl NetworkInfo {
    /// Snapshot used before the first check completes.
    pub fn unknown() -> Self {
        Self {
            status: NetworkStatus::Offline,
            connection_type: None,
            speed_mbps: None,
            latency_ms: None,
            last_checked: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability() {
        assert!(NetworkStatus::Online.is_reachable());
        assert!(NetworkStatus::Slow.is_reachable());
        assert!(NetworkStatus::Unstable.is_reachable());
        assert!(!NetworkStatus::Offline.is_reachable());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&NetworkStatus::Unstable).unwrap(),
            "\"unstable\""
        );
        assert_eq!(NetworkStatus::Slow.to_string(), "slow");
    }

    #[test]
    fn unknown_snapshot_is_offline() {
        let info = NetworkInfo::unknown();
        assert_eq!(info.status, NetworkStatus::Offline);
        assert!(info.latency_ms.is_none());
    }
}
