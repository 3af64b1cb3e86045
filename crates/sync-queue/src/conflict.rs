//! Conflict records and field-level diffing.

use crate::{SyncError, SyncItem, SyncResult};
use chrono::{DateTime, Utc};
use platform_bridge::{Record, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which copy wins when a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Push the local payload over the remote copy.
    Local,
    /// Adopt the remote copy.
    Remote,
    /// Push a caller-supplied merged payload.
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        })
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "keep-local" => Ok(Resolution::Local),
            "remote" | "keep-remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            other => Err(format!("unknown resolution: {}", other)),
        }
    }
}

/// A divergence between a queued change and the remote copy.
///
/// Once `resolved` is set the record is never modified again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    /// Sync item paused by this conflict.
    pub item_id: String,
    pub resource_type: ResourceType,
    pub local_payload: Record,
    /// Authoritative remote copy, `None` when the record no longer exists
    /// remotely.
    #[serde(default)]
    pub remote_payload: Option<Record>,
    pub conflict_fields: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Payload the record converged to, `None` if it converged to deleted.
    #[serde(default)]
    pub resolved_payload: Option<Record>,
}

impl SyncConflict {
    /// Whether the remote side had deleted the record.
    pub fn remote_deleted(&self) -> bool {
        self.remote_payload.is_none()
    }
}

/// Field-level diff of local and remote records.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    ignored_fields: BTreeSet<String>,
}

impl ConflictResolver {
    /// Create a resolver that skips `ignored_fields` (bookkeeping such as
    /// `updated_at`) when diffing.
    pub fn new<I, S>(ignored_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_fields: ignored_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Top-level fields whose values differ. A field present on one side
    /// only counts as differing.
    pub fn diff(&self, local: &Record, remote: &Record) -> BTreeSet<String> {
        local
            .keys()
            .chain(remote.keys())
            .filter(|field| !self.ignored_fields.contains(*field))
            .filter(|field| local.get(*field) != remote.get(*field))
            .cloned()
            .collect()
    }

    /// Build the conflict record for `item` against the remote copy. A
    /// missing remote copy differs in every local field.
    pub fn detect(&self, item: &SyncItem, remote: Option<Record>) -> SyncConflict {
        let conflict_fields = match &remote {
            Some(remote) => self.diff(&item.payload, remote),
            None => self.diff(&item.payload, &Record::new()),
        };
        SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            resource_type: item.resource_type,
            local_payload: item.payload.clone(),
            remote_payload: remote,
            conflict_fields,
            detected_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution: None,
            resolved_payload: None,
        }
    }

    /// Payload a resolution converges to. `None` means the record stays
    /// deleted (remote resolution of a remotely deleted record).
    pub fn select_payload(
        conflict: &SyncConflict,
        resolution: Resolution,
        merged: Option<Record>,
    ) -> SyncResult<Option<Record>> {
        if conflict.resolved {
            return Err(SyncError::AlreadyResolved(conflict.id.clone()));
        }
        match resolution {
            Resolution::Local => Ok(Some(conflict.local_payload.clone())),
            Resolution::Remote => Ok(conflict.remote_payload.clone()),
            Resolution::Merge => merged.map(Some).ok_or(SyncError::MissingMergedPayload),
        }
    }
}
