//! Realtime wire protocol.

use platform_bridge::MessagePayload;
use serde::{Deserialize, Serialize};

/// A frame sent to or received from the realtime server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    // Connection
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    ConnectionAck {
        session_id: String,
    },
    Heartbeat,
    Error {
        code: String,
        message: String,
    },

    // Topics
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Subscribed {
        topic: String,
    },

    // Topic traffic
    Message {
        topic: String,
        message_id: String,
        payload: MessagePayload,
    },
    Typing {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        is_typing: bool,
    },
    ReadReceipt {
        topic: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_by: Option<String>,
    },
}

/// A server-pushed event delivered to a topic subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    Message {
        message_id: String,
        payload: MessagePayload,
    },
    Typing {
        user_id: Option<String>,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: String,
        read_by: Option<String>,
    },
}

impl WireMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Split a topic frame into its topic and subscriber event.
    pub fn into_topic_event(self) -> Option<(String, TopicEvent)> {
        match self {
            Self::Message {
                topic,
                message_id,
                payload,
            } => Some((topic, TopicEvent::Message { message_id, payload })),
            Self::Typing {
                topic,
                user_id,
                is_typing,
            } => Some((topic, TopicEvent::Typing { user_id, is_typing })),
            Self::ReadReceipt {
                topic,
                message_id,
                read_by,
            } => Some((topic, TopicEvent::ReadReceipt { message_id, read_by })),
            _ => None,
        }
    }
}
