//! Queued message types.

use chrono::{DateTime, Utc};
use platform_bridge::{MessagePayload, OutboundMessage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Drain priority. Higher priorities are always attempted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank, lower drains first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        })
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Delivery state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    /// Retries exhausted; only an explicit retry revives it.
    Failed,
}

/// A chat message waiting for (or recently done with) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub status: MessageStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Enqueue order, breaks ties within a priority.
    pub seq: u64,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    /// Id assigned by the platform on delivery.
    #[serde(default)]
    pub server_id: Option<String>,
}

impl QueuedMessage {
    pub(crate) fn sort_key(&self) -> (u8, u64) {
        (self.priority.rank(), self.seq)
    }

    pub(crate) fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}
