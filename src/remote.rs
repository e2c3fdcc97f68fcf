//! HTTP client for the remote records API.
//!
//! Every entity exposes a collection endpoint (`GET ?patientProfileId=`,
//! `POST`) and an item endpoint (`PUT`, `DELETE`). Requests carry the bearer
//! token; bodies are JSON.

use reqwest::{Method, Response};
use serde_json::Value;
use std::time::Duration;

use crate::models::{EntityType, QueueItem, SyncAction};

/// Errors talking to the remote API.
#[derive(Debug)]
pub enum RemoteError {
    /// No API URL configured.
    NotConfigured,
    /// No bearer token available.
    Unauthenticated,
    /// Server answered with a non-2xx status.
    Status { status: u16, message: String },
    /// Connection, TLS or timeout failure.
    Transport(String),
    /// Response body was not the expected JSON.
    Decode(String),
    /// Queue item names an entity this client cannot route.
    UnknownEntity(String),
    /// Queue item payload has no record id.
    MissingId,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::NotConfigured => {
                write!(f, "Remote API not configured. Add sync.api_url to config.")
            }
            RemoteError::Unauthenticated => write!(f, "No authentication token available"),
            RemoteError::Status { status, message } => {
                write!(f, "Server returned status {}: {}", status, message)
            }
            RemoteError::Transport(e) => write!(f, "Request failed: {}", e),
            RemoteError::Decode(e) => write!(f, "Invalid response: {}", e),
            RemoteError::UnknownEntity(tag) => write!(f, "Unsupported entity: {}", tag),
            RemoteError::MissingId => write!(f, "Payload has no record id"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn collection_url(&self, entity: EntityType) -> String {
        format!("{}/{}", self.base_url, entity.api_path())
    }

    pub fn item_url(&self, entity: EntityType, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(entity),
            urlencoding::encode(id)
        )
    }

    /// Fetches the authoritative records of one scope.
    pub async fn list(
        &self,
        token: &str,
        entity: EntityType,
        scope_id: &str,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = format!(
            "{}?patientProfileId={}",
            self.collection_url(entity),
            urlencoding::encode(scope_id)
        );
        let response = self.send(Method::GET, &url, token, None).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        extract_list(entity, body)
    }

    pub async fn create(
        &self,
        token: &str,
        entity: EntityType,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.send(Method::POST, &self.collection_url(entity), token, Some(payload))
            .await
            .map(drop)
    }

    pub async fn update(
        &self,
        token: &str,
        entity: EntityType,
        id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.send(Method::PUT, &self.item_url(entity, id), token, Some(payload))
            .await
            .map(drop)
    }

    pub async fn delete(&self, token: &str, entity: EntityType, id: &str) -> Result<(), RemoteError> {
        self.send(Method::DELETE, &self.item_url(entity, id), token, None)
            .await
            .map(drop)
    }

    /// Replays one queued mutation against its endpoint.
    ///
    /// Unknown entity tags and payloads without an id are errors, never skips.
    pub async fn dispatch(&self, token: &str, item: &QueueItem) -> Result<(), RemoteError> {
        let entity = item
            .entity_type()
            .map_err(|_| RemoteError::UnknownEntity(item.entity.clone()))?;

        match item.action {
            SyncAction::Create => self.create(token, entity, &item.payload).await,
            SyncAction::Update => {
                let id = item.record_id().ok_or(RemoteError::MissingId)?;
                self.update(token, entity, &id, &item.payload).await
            }
            SyncAction::Delete => {
                let id = item.record_id().ok_or(RemoteError::MissingId)?;
                self.delete(token, entity, &id).await
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Response, RemoteError> {
        tracing::debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            message: error_message(&text),
        })
    }
}

/// Accepts a bare array, `{"items": [...]}` or `{"<entity>": [...]}`.
pub fn extract_list(entity: EntityType, body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            for key in ["items", entity.tag(), entity.api_path()] {
                if let Some(Value::Array(items)) = object.remove(key) {
                    return Ok(items);
                }
            }
            Err(RemoteError::Decode(format!(
                "expected a list of {} in response",
                entity
            )))
        }
        other => Err(RemoteError::Decode(format!(
            "expected a list of {}, got {}",
            entity, other
        ))),
    }
}

/// Pulls a human-readable message out of a structured error body.
fn error_message(body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            match object.get(key) {
                Some(Value::String(message)) => return message.clone(),
                Some(Value::Array(messages)) => {
                    let joined: Vec<String> = messages
                        .iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect();
                    if !joined.is_empty() {
                        return joined.join("; ");
                    }
                }
                _ => {}
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no details".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}
