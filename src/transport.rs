//! GraphQL transport
//!
//! One `send` is one HTTP round trip. Classification of the response
//! (success, transient, rate limited, ...) happens in the executor, so the
//! transport only reports what came back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Body of a GraphQL POST
#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    pub query: String,
    pub variables: Value,
}

impl GraphqlRequest {
    /// Operation name from the document (`query RepoIssues(...)` -> `RepoIssues`).
    pub fn operation_name(&self) -> Option<&str> {
        let rest = self.query.trim_start().strip_prefix("query")?.trim_start();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        (end > 0).then(|| &rest[..end])
    }
}

/// What came back from one round trip
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, or the raw text as a JSON string when it was not JSON.
    pub body: Value,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Sends GraphQL requests upstream
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    /// Perform one request. `Err` means no response was received at all.
    async fn send(&self, request: &GraphqlRequest) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport for the GitHub GraphQL endpoint
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }

    fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn send(&self, request: &GraphqlRequest) -> Result<TransportResponse> {
        debug!(
            "POST {} ({})",
            self.endpoint,
            request.operation_name().unwrap_or("anonymous")
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(USER_AGENT, concat!("orgmirror/", env!("CARGO_PKG_VERSION")))
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status().as_u16();
        let headers = Self::collect_headers(response.headers());
        let text = response
            .text()
            .await
            .context("Failed to read GraphQL response body")?;

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
