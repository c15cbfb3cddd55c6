//! Remote API Client - HTTP communication with the clinic server
//!
//! Handles all REST calls the sync engine makes:
//! - Reachability probe (`GET /health`)
//! - Collection snapshots for download
//! - Create / update / delete per entity kind, with `uuid` idempotency tokens
//! - Batched checkup-item writes (`POST /checkups/{id}/items`)
//! - Raw replay of legacy queued requests
//!
//! Every response uses the `{success, data, error}` envelope.

use super::models::EntityKind;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote system as seen by the sync engine
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Lightweight reachability check
    async fn health(&self) -> Result<(), RemoteError>;

    /// Full current snapshot of a collection
    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, RemoteError>;

    /// Create (or upsert by `uuid`) a record; returns the authoritative record
    async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, RemoteError>;

    /// Update a record by its authoritative id
    async fn update(&self, kind: EntityKind, id: i64, body: Value) -> Result<Option<Value>, RemoteError>;

    async fn delete(&self, kind: EntityKind, id: i64) -> Result<(), RemoteError>;

    /// Replace the item list of a checkup; returns stored items when the
    /// server sends them back
    async fn save_items(&self, checkup_id: i64, items: Vec<Value>) -> Result<Vec<Value>, RemoteError>;

    async fn delete_item(&self, checkup_id: i64, item_id: i64) -> Result<(), RemoteError>;

    /// Send a request recorded by the legacy offline queue
    async fn send_raw(&self, method: &str, endpoint: &str, body: Option<Value>) -> Result<Value, RemoteError>;
}

/// reqwest-backed client for the clinic REST API
pub struct RemoteApiClient {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl RemoteApiClient {
    /// Create a client rooted at `base_url` (e.g. `http://localhost:3000/api`)
    pub fn new(base_url: &str, timeout: Duration, probe_timeout: Duration) -> Result<Self, RemoteError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| RemoteError::InvalidRequest(format!("invalid base URL {}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn list_path(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Patient => "patients",
            EntityKind::CheckupType => "checkup-types",
            EntityKind::Checkup => "checkups",
            EntityKind::CheckupItem => "checkups/all-items",
        }
    }

    /// Collection path for per-record writes; items go through `save_items`
    fn write_path(kind: EntityKind) -> Result<&'static str, RemoteError> {
        match kind {
            EntityKind::Patient => Ok("patients"),
            EntityKind::Checkup => Ok("checkups"),
            EntityKind::CheckupType | EntityKind::CheckupItem => Err(RemoteError::InvalidRequest(
                format!("{} records are not written individually", kind),
            )),
        }
    }
}

#[async_trait]
impl RemoteStore for RemoteApiClient {
    async fn health(&self) -> Result<(), RemoteError> {
        let response = self.client
            .get(self.url("health"))
            .timeout(self.probe_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, RemoteError> {
        let response = self.client
            .get(self.url(Self::list_path(kind)))
            .send()
            .await?;

        match handle_response(response).await? {
            Some(Value::Array(records)) => Ok(records),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(RemoteError::InvalidResponse(format!(
                "expected an array of {} records, got {}",
                kind, other
            ))),
        }
    }

    async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, RemoteError> {
        let response = self.client
            .post(self.url(Self::write_path(kind)?))
            .json(&body)
            .send()
            .await?;

        handle_response(response).await?
            .ok_or_else(|| RemoteError::InvalidResponse(format!("create {} returned no record", kind)))
    }

    async fn update(&self, kind: EntityKind, id: i64, body: Value) -> Result<Option<Value>, RemoteError> {
        let response = self.client
            .put(self.url(&format!("{}/{}", Self::write_path(kind)?, id)))
            .json(&body)
            .send()
            .await?;

        handle_response(response).await
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> Result<(), RemoteError> {
        let response = self.client
            .delete(self.url(&format!("{}/{}", Self::write_path(kind)?, id)))
            .send()
            .await?;

        handle_response(response).await.map(|_| ())
    }

    async fn save_items(&self, checkup_id: i64, items: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        let response = self.client
            .post(self.url(&format!("checkups/{}/items", checkup_id)))
            .json(&json!({ "items": items }))
            .send()
            .await?;

        match handle_response(response).await? {
            Some(Value::Array(stored)) => Ok(stored),
            _ => Ok(Vec::new()),
        }
    }

    async fn delete_item(&self, checkup_id: i64, item_id: i64) -> Result<(), RemoteError> {
        let response = self.client
            .delete(self.url(&format!("checkups/{}/items/{}", checkup_id, item_id)))
            .send()
            .await?;

        handle_response(response).await.map(|_| ())
    }

    async fn send_raw(&self, method: &str, endpoint: &str, body: Option<Value>) -> Result<Value, RemoteError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RemoteError::InvalidRequest(format!("invalid method {}", method)))?;

        let mut request = self.client.request(method, self.url(endpoint));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        Ok(handle_response(response).await?.unwrap_or(Value::Null))
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// `{success, data, error}` response envelope
#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn default_success() -> bool {
    true
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// Network-level failure: the client should degrade to offline mode
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Unwrap the envelope of a 2xx response, or map the error status
async fn handle_response(response: reqwest::Response) -> Result<Option<Value>, RemoteError> {
    let status = response.status();

    if !status.is_success() {
        return Err(handle_error(response).await);
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(&text)
        .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

    if envelope.success {
        Ok(envelope.data)
    } else {
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message: envelope.error.or(envelope.message).unwrap_or_else(|| "request failed".to_string()),
        })
    }
}

/// Convert an error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    let message = serde_json::from_str::<Envelope>(&text)
        .ok()
        .and_then(|env| env.error.or(env.message))
        .unwrap_or(text);

    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        _ => RemoteError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
