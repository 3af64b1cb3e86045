//! Sync item types.

use chrono::{DateTime, Utc};
use platform_bridge::{Record, ResourceType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutation applied to the remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        })
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    /// Applied remotely. Items are removed on success, so this is transient.
    Synced,
    /// Retries exhausted or rejected outright; kept until cleared.
    Failed,
    /// Paused until its conflict is resolved.
    Conflict,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        })
    }
}

/// A queued record mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: String,
    pub resource_type: ResourceType,
    pub payload: Record,
    pub operation: SyncOperation,
    pub created_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncItem {
    /// Id of the record this item mutates.
    pub fn record_id(&self) -> Option<&str> {
        self.resource_type.record_id(&self.payload).ok()
    }
}
