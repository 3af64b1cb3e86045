//! Resource kinds and the remote CRUD seam used by the sync queue.

use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A record as exchanged with the platform: a JSON object.
pub type Record = Map<String, Value>;

/// Kinds of records the platform exposes CRUD operations for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Patient,
    Consultation,
    MedicalRecord,
    Message,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Patient,
        ResourceType::Consultation,
        ResourceType::MedicalRecord,
        ResourceType::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "patient",
            ResourceType::Consultation => "consultation",
            ResourceType::MedicalRecord => "medical_record",
            ResourceType::Message => "message",
        }
    }

    /// Collection path segment on the platform API.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourceType::Patient => "patients",
            ResourceType::Consultation => "consultations",
            ResourceType::MedicalRecord => "medical_records",
            ResourceType::Message => "messages",
        }
    }

    /// Fields a create or update must carry besides `id`.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Patient => &["name", "phone"],
            ResourceType::Consultation => &["patient_id", "doctor_id"],
            ResourceType::MedicalRecord => &["patient_id", "doctor_id", "title"],
            ResourceType::Message => &["consultation_id", "content"],
        }
    }

    /// Extract the non-empty string `id` of a record.
    pub fn record_id<'a>(&self, record: &'a Record) -> BridgeResult<&'a str> {
        match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(BridgeError::Validation(format!(
                "{} record is missing a string id",
                self
            ))),
        }
    }

    /// Check that a full record carries an id and every required field.
    pub fn validate_record(&self, record: &Record) -> BridgeResult<()> {
        self.record_id(record)?;
        let missing: Vec<&str> = self
            .required_fields()
            .iter()
            .copied()
            .filter(|field| matches!(record.get(*field), None | Some(Value::Null)))
            .collect();
        if !missing.is_empty() {
            return Err(BridgeError::Validation(format!(
                "{} record is missing required fields: {}",
                self,
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|rt| rt.as_str() == s || rt.endpoint() == s)
            .ok_or_else(|| BridgeError::Validation(format!("unknown resource type: {}", s)))
    }
}

/// Remote CRUD operations per resource type.
///
/// Implementations report divergence as [`BridgeError::Conflict`] and missing
/// records as [`BridgeError::NotFound`].
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn create(&self, resource: ResourceType, record: &Record) -> BridgeResult<Record>;

    async fn update(&self, resource: ResourceType, id: &str, record: &Record)
        -> BridgeResult<Record>;

    async fn delete(&self, resource: ResourceType, id: &str) -> BridgeResult<()>;

    /// Fetch the authoritative remote copy, `None` if it does not exist.
    async fn get(&self, resource: ResourceType, id: &str) -> BridgeResult<Option<Record>>;
}
