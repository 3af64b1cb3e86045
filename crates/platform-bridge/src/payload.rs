//! Outbound chat message payloads and the transport seam.

use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest text body accepted for a single message, in characters.
pub const MAX_TEXT_LENGTH: usize = 5_000;

/// Content of a chat message, one variant per message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        content: String,
    },
    Image {
        file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Voice {
        file_path: String,
        duration_secs: u32,
    },
    File {
        file_path: String,
        file_name: String,
    },
}

impl MessagePayload {
    /// Create a text payload.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::File { .. } => "file",
        }
    }

    /// Reject payloads that can never be delivered.
    pub fn validate(&self) -> BridgeResult<()> {
        match self {
            Self::Text { content } => {
                if content.trim().is_empty() {
                    return Err(BridgeError::Validation(
                        "text message content is empty".to_string(),
                    ));
                }
                let length = content.chars().count();
                if length > MAX_TEXT_LENGTH {
                    return Err(BridgeError::Validation(format!(
                        "text message is {} characters, limit is {}",
                        length, MAX_TEXT_LENGTH
                    )));
                }
            }
            Self::Image { file_path, .. } => require_path(file_path, "image")?,
            Self::Voice {
                file_path,
                duration_secs,
            } => {
                require_path(file_path, "voice")?;
                if *duration_secs == 0 {
                    return Err(BridgeError::Validation(
                        "voice message has zero duration".to_string(),
                    ));
                }
            }
            Self::File {
                file_path,
                file_name,
            } => {
                require_path(file_path, "file")?;
                if file_name.trim().is_empty() {
                    return Err(BridgeError::Validation(
                        "file message has no file name".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn require_path(path: &str, kind: &str) -> BridgeResult<()> {
    if path.trim().is_empty() {
        return Err(BridgeError::Validation(format!(
            "{} message has no file path",
            kind
        )));
    }
    Ok(())
}

/// A message handed to the platform for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Client-assigned id, stable across retries.
    pub id: String,
    pub conversation_id: String,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,
}

/// Platform answer to a send attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SendReceipt {
    pub success: bool,
    /// Server-assigned id, when the platform returns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendReceipt {
    /// Successful delivery.
    pub fn delivered(id: Option<String>) -> Self {
        Self {
            success: true,
            id,
            error: None,
        }
    }

    /// Rejected delivery.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            id: None,
            error: Some(error.into()),
        }
    }
}

/// Delivers chat messages to the platform.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Attempt delivery of one message.
    ///
    /// `Ok` with `success = false` and `Err` are both delivery failures.
    async fn send(&self, conversation_id: &str, message: &OutboundMessage)
        -> BridgeResult<SendReceipt>;
}
