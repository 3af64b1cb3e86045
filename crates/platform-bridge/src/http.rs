//! HTTP client for the platform API.
//!
//! Implements both [`MessageTransport`] and [`ResourceApi`] against a REST
//! backend:
//! - `POST {base}/conversations/{id}/messages`
//! - `POST {base}/{collection}`, `PUT|DELETE|GET {base}/{collection}/{id}`

use crate::{
    BridgeError, BridgeResult, MessageTransport, OutboundMessage, Record, ResourceApi,
    ResourceType, SendReceipt,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Platform API client.
#[derive(Clone)]
pub struct HttpBridgeClient {
    http_client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

impl HttpBridgeClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> BridgeResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn collection_url(&self, resource: ResourceType) -> String {
        format!("{}/{}", self.base_url, resource.endpoint())
    }

    fn record_url(&self, resource: ResourceType, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, resource.endpoint(), id)
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Parse a record response, falling back to `sent` for empty bodies.
    async fn record_response(
        response: reqwest::Response,
        resource: ResourceType,
        id: &str,
        sent: &Record,
    ) -> BridgeResult<Record> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, resource, id, &body));
        }
        if body.trim().is_empty() {
            return Ok(sent.clone());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Map a non-success status to the bridge error taxonomy.
fn status_error(status: StatusCode, resource: ResourceType, id: &str, body: &str) -> BridgeError {
    let message = truncate(body);
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => BridgeError::Conflict {
            resource: resource.to_string(),
            id: id.to_string(),
            message,
        },
        StatusCode::NOT_FOUND => BridgeError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        },
        _ => BridgeError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[async_trait]
impl MessageTransport for HttpBridgeClient {
    async fn send(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> BridgeResult<SendReceipt> {
        let url = self.messages_url(conversation_id);
        debug!(message_id = %message.id, conversation_id, "Sending message over HTTP");

        let response = self
            .authorize(self.http_client.post(&url))
            .json(message)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let id = serde_json::from_str::<SendResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.id);
            return Ok(SendReceipt::delivered(id));
        }

        warn!(status = %status, message_id = %message.id, "Platform rejected message");
        let err = BridgeError::Status {
            status: status.as_u16(),
            message: truncate(&body),
        };
        if err.is_retryable() {
            Err(err)
        } else {
            Ok(SendReceipt::rejected(err.to_string()))
        }
    }
}

#[async_trait]
impl ResourceApi for HttpBridgeClient {
    async fn create(&self, resource: ResourceType, record: &Record) -> BridgeResult<Record> {
        let id = resource.record_id(record)?.to_string();
        let response = self
            .authorize(self.http_client.post(self.collection_url(resource)))
            .json(record)
            .send()
            .await?;
        Self::record_response(response, resource, &id, record).await
    }

    async fn update(
        &self,
        resource: ResourceType,
        id: &str,
        record: &Record,
    ) -> BridgeResult<Record> {
        let response = self
            .authorize(self.http_client.put(self.record_url(resource, id)))
            .json(record)
            .send()
            .await?;
        Self::record_response(response, resource, id, record).await
    }

    async fn delete(&self, resource: ResourceType, id: &str) -> BridgeResult<()> {
        let response = self
            .authorize(self.http_client.delete(self.record_url(resource, id)))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, resource, id, &body))
    }

    async fn get(&self, resource: ResourceType, id: &str) -> BridgeResult<Option<Record>> {
        let response = self
            .authorize(self.http_client.get(self.record_url(resource, id)))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, resource, id, &body));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpBridgeClient {
        HttpBridgeClient::new(
            "https://api.example.com/v1/",
            Some("token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let client = client();
        assert_eq!(
            client.collection_url(ResourceType::MedicalRecord),
            "https://api.example.com/v1/medical_records"
        );
        assert_eq!(
            client.record_url(ResourceType::Patient, "p-1"),
            "https://api.example.com/v1/patients/p-1"
        );
        assert_eq!(
            client.messages_url("c-9"),
            "https://api.example.com/v1/conversations/c-9/messages"
        );
    }

    #[test]
    fn conflict_statuses_map_to_conflict() {
        let err = status_error(StatusCode::CONFLICT, ResourceType::Patient, "p-1", "stale");
        assert!(err.is_conflict());
        let err = status_error(
            StatusCode::PRECONDITION_FAILED,
            ResourceType::Patient,
            "p-1",
            "",
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn other_statuses_map_to_status_or_not_found() {
        let err = status_error(StatusCode::NOT_FOUND, ResourceType::Message, "m-1", "");
        assert!(matches!(err, BridgeError::NotFound { .. }));

        let err = status_error(
            StatusCode::BAD_GATEWAY,
            ResourceType::Message,
            "m-1",
            "upstream",
        );
        match err {
            BridgeError::Status { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY * 2);
        let truncated = truncate(&body);
        assert_eq!(truncated.len(), MAX_ERROR_BODY + 3);
        assert!(truncated.ends_with("..."));
    }
}
