//! Chat backend client
//!
//! Four request/response calls, each with its own timeout. Failures are
//! converted here: health and ensure become `false`, history becomes
//! `History::Unavailable`, and send returns a typed `ClientError` the caller
//! can classify.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::message::{Sender, StoredMessage};

/// Reply text when the server answers without a usable field
pub const NO_RESPONSE: &str = "No response";

/// Reply fields in priority order
const REPLY_FIELDS: [&str; 3] = ["response", "result", "answer"];

/// Per-operation timeouts
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub health: Duration,
    pub ensure: Duration,
    pub history: Duration,
    /// Chat inference can be slow
    pub send: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(5),
            ensure: Duration::from_secs(10),
            history: Duration::from_secs(10),
            send: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("connection to {url} dropped")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("server reported an error: {0}")]
    Server(String),

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ClientError {
    /// Refused, dropped mid-request, DNS/network-level, or timed out
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::Timeout { .. } | ClientError::Network { .. }
        )
    }

    fn from_reqwest(url: &Url, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout {
                url: url.to_string(),
            }
        } else if e.is_connect() {
            ClientError::Connect {
                url: url.to_string(),
                source: e,
            }
        } else if e.is_request() || e.is_body() {
            // reset, closed or incomplete response after the connect succeeded
            ClientError::Network {
                url: url.to_string(),
                source: e,
            }
        } else {
            ClientError::Request(e)
        }
    }
}

/// Server history for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum History {
    /// Server answered; may be empty
    Messages(Vec<StoredMessage>),
    /// Server unreachable or failed
    Unavailable,
}

/// Health endpoint result (`doctor` prints it)
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub db_status: Option<String>,
}

/// The backend operations the app depends on
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn check_health(&self) -> bool;
    async fn ensure_session(&self, user_id: &str, session_id: &str) -> bool;
    async fn fetch_history(&self, user_id: &str, session_id: &str) -> History;
    async fn send_message(
        &self,
        user_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<String, ClientError>;
}

/// HTTP client for the chat backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    timeouts: Timeouts,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, Timeouts::default())
    }

    pub fn with_timeouts(base_url: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    /// Base URL plus percent-encoded path segments
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// GET the diagnostic endpoint
    pub async fn health(&self) -> Result<HealthReport, ClientError> {
        let url = self.endpoint(&["debug", "db-test"])?;
        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeouts.health)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&url, e))?;

        let body = success_body(response).await?;
        let db_status = body
            .get("db_status")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(HealthReport { db_status })
    }

    async fn try_ensure(&self, user_id: &str, session_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&["sessions", "ensure"])?;
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeouts.ensure)
            .json(&EnsureRequest {
                user_id,
                session_id,
            })
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&url, e))?;

        success_body(response).await?;
        Ok(())
    }

    async fn try_history(&self, user_id: &str, session_id: &str) -> Result<Vec<StoredMessage>, ClientError> {
        let url = self.endpoint(&["history", user_id, session_id])?;
        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeouts.history)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&url, e))?;

        let body = success_body(response).await?;
        Ok(parse_history(&body))
    }
}

#[async_trait]
impl ChatBackend for BackendClient {
    async fn check_health(&self) -> bool {
        match self.health().await {
            Ok(report) => {
                if report.db_status.as_deref() == Some("error") {
                    tracing::warn!("backend reachable but reports a database error");
                }
                tracing::info!(url = %self.base_url, "backend reachable");
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.base_url, error = %e, "health check failed");
                false
            }
        }
    }

    async fn ensure_session(&self, user_id: &str, session_id: &str) -> bool {
        match self.try_ensure(user_id, session_id).await {
            Ok(()) => {
                tracing::debug!(session_id, "session ensured");
                true
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "ensure session failed");
                false
            }
        }
    }

    async fn fetch_history(&self, user_id: &str, session_id: &str) -> History {
        match self.try_history(user_id, session_id).await {
            Ok(messages) => {
                tracing::debug!(session_id, count = messages.len(), "history fetched");
                History::Messages(messages)
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "history fetch failed");
                History::Unavailable
            }
        }
    }

    async fn send_message(
        &self,
        user_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<String, ClientError> {
        let url = self.endpoint(&["chat"])?;
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeouts.send)
            .json(&ChatRequest {
                user_query: text,
                user_id,
                session_id,
            })
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&url, e))?;

        let body = success_body(response).await?;
        extract_reply(&body)
    }
}

/// Reject non-2xx, then decode JSON (an empty body decodes to null)
async fn success_body(response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let url = response.url().clone();
    let text = response
        .text()
        .await
        .map_err(|e| ClientError::from_reqwest(&url, e))?;

    if !status.is_success() {
        return Err(ClientError::Status { status, body: text });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
}

/// First non-empty reply field, else an error payload, else the fallback
fn extract_reply(body: &Value) -> Result<String, ClientError> {
    for field in REPLY_FIELDS {
        if let Some(text) = body.get(field).and_then(Value::as_str) {
            if !text.is_empty() {
                return Ok(text.to_string());
            }
        }
    }

    if let Some(err) = body.get("error").filter(|v| !v.is_null()) {
        let detail = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(ClientError::Server(detail));
    }

    Ok(NO_RESPONSE.to_string())
}

/// `{messages: [...]}`; a missing or non-array field means no messages
fn parse_history(body: &Value) -> Vec<StoredMessage> {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|raw| raw.iter().filter_map(parse_history_entry).collect())
        .unwrap_or_default()
}

/// Accepts `{sender, text}` or `{role|author, parts: [{text|content} | "text"]}`
fn parse_history_entry(entry: &Value) -> Option<StoredMessage> {
    let (sender, text) = if entry.get("sender").is_some() && entry.get("text").is_some() {
        let sender = match entry.get("sender")?.as_str()? {
            "user" => Sender::User,
            _ => Sender::Bot,
        };
        (sender, entry.get("text")?.as_str()?.to_string())
    } else {
        let role = entry
            .get("role")
            .or_else(|| entry.get("author"))
            .and_then(Value::as_str)?;
        let sender = if role == "user" { Sender::User } else { Sender::Bot };

        let first = entry.get("parts")?.as_array()?.first()?;
        let text = match first {
            Value::String(s) => s.clone(),
            Value::Object(_) => first
                .get("text")
                .or_else(|| first.get("content"))
                .and_then(Value::as_str)?
                .to_string(),
            _ => return None,
        };
        (sender, text)
    };

    if text.is_empty() {
        return None;
    }
    Some(StoredMessage { sender, text })
}

// ═══════════════════════════════════════════════════════════════
// API Types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct EnsureRequest<'a> {
    user_id: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    user_query: &'a str,
    user_id: &'a str,
    session_id: &'a str,
}
