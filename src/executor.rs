//! Backoff and rate-limit aware request executor
//!
//! Two independent strategies share one driver loop:
//! - [`BackoffPolicy`] retries transient failures with exponential delays
//!   and a small attempt budget.
//! - [`RateLimitPolicy`] waits out rate-limit responses using whatever
//!   reset signal the response carries, with its own retry budget.
//!
//! Rate-limit retries never consume transient attempts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::transport::{GraphqlRequest, GraphqlTransport, TransportResponse};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_RATE_LIMIT_RETRIES: u32 = 10;
/// Used when no signal is present, and as the floor for every computed wait.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Error `type`/`extensions.code` values that mean "rate limited".
const RATE_LIMIT_CODES: &[&str] = &[
    "RATE_LIMITED",
    "RATE_LIMIT",
    "SECONDARY_RATE_LIMIT",
    "GRAPHQL_RATE_LIMIT",
    "ABUSE_DETECTED",
];

/// Per-call options
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Human-readable label used in logs and error messages.
    pub context: String,
    /// Overrides the executor's transient attempt budget.
    pub max_attempts: Option<u32>,
}

impl ExecuteOptions {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            max_attempts: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: INITIAL_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failure (1-based): 500ms, 1s, 2s, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1u32 << exponent)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Reset hints pulled from a rate-limited response, in precedence order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSignals {
    /// `Retry-After` header: delta seconds or an HTTP date.
    pub retry_after: Option<String>,
    /// `X-RateLimit-Reset` header: epoch seconds.
    pub reset: Option<String>,
    /// Error extension delay in seconds.
    pub extension_delay: Option<Value>,
    /// Error extension reset time: epoch seconds or RFC 3339.
    pub extension_reset: Option<Value>,
}

impl RateLimitSignals {
    pub fn from_response(response: &TransportResponse, errors: &[GraphqlError]) -> Self {
        let extension = |keys: &[&str]| {
            errors
                .iter()
                .filter_map(|e| e.extensions.as_ref())
                .find_map(|ext| keys.iter().find_map(|k| ext.get(*k).filter(|v| !v.is_null())))
                .cloned()
        };

        Self {
            retry_after: response.header("retry-after").map(str::to_string),
            reset: response.header("x-ratelimit-reset").map(str::to_string),
            extension_delay: extension(&["retryAfter", "retry_after"]),
            extension_reset: extension(&["resetAt", "reset_at", "rateLimitReset"]),
        }
    }
}

/// Waiting strategy for rate-limited responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_retries: u32,
    /// Default wait and lower bound on any signalled wait.
    pub minimum_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RATE_LIMIT_RETRIES,
            minimum_wait: DEFAULT_RATE_LIMIT_WAIT,
        }
    }
}

impl RateLimitPolicy {
    /// How long to wait before retrying, given the response's signals.
    pub fn wait_for(&self, signals: &RateLimitSignals, now: DateTime<Utc>) -> Duration {
        let requested = signals
            .retry_after
            .as_deref()
            .and_then(|v| parse_retry_after(v, now))
            .or_else(|| signals.reset.as_deref().and_then(|v| until_epoch_str(v, now)))
            .or_else(|| signals.extension_delay.as_ref().and_then(seconds_value))
            .or_else(|| {
                signals
                    .extension_reset
                    .as_ref()
                    .and_then(|v| reset_value(v, now))
            });

        match requested {
            Some(wait) => wait.max(self.minimum_wait),
            None => self.minimum_wait,
        }
    }
}

fn until(reset: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (reset - now).to_std().unwrap_or(Duration::ZERO)
}

fn until_epoch(epoch: i64, now: DateTime<Utc>) -> Option<Duration> {
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|reset| until(reset, now))
}

fn until_epoch_str(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    until_epoch(value.trim().parse::<i64>().ok()?, now)
}

fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| until(at.with_timezone(&Utc), now))
}

fn seconds_value(value: &Value) -> Option<Duration> {
    let secs = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn reset_value(value: &Value, now: DateTime<Utc>) -> Option<Duration> {
    match value {
        Value::Number(n) => until_epoch(n.as_i64()?, now),
        Value::String(s) => {
            if let Ok(epoch) = s.trim().parse::<i64>() {
                return until_epoch(epoch, now);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|at| until(at.with_timezone(&Utc), now))
        }
        _ => None,
    }
}

/// One entry of a GraphQL `errors` array
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphqlError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub extensions: Option<Value>,
}

impl GraphqlError {
    fn codes(&self) -> impl Iterator<Item = &str> {
        let ext_code = self
            .extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str);
        self.error_type.as_deref().into_iter().chain(ext_code)
    }

    fn has_code(&self, wanted: &[&str]) -> bool {
        self.codes()
            .any(|code| wanted.iter().any(|w| w.eq_ignore_ascii_case(code)))
    }

    fn is_rate_limit(&self) -> bool {
        self.has_code(RATE_LIMIT_CODES) || self.message.to_lowercase().contains("rate limit")
    }

    fn is_not_found(&self) -> bool {
        self.has_code(&["NOT_FOUND"])
    }
}

/// Result of classifying one response
#[derive(Debug)]
enum Failure {
    RateLimited {
        signals: RateLimitSignals,
        message: String,
    },
    /// Eligible for the backoff strategy.
    Retryable(SyncError),
    Fatal(SyncError),
}

fn parse_errors(body: &Value) -> Vec<GraphqlError> {
    match body.get("errors") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone()).unwrap_or_else(|_| GraphqlError {
                    message: item.to_string(),
                    ..Default::default()
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn failure_message(response: &TransportResponse, errors: &[GraphqlError]) -> String {
    if !errors.is_empty() {
        return errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
    }
    let detail = match &response.body {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    };
    format!("HTTP {} {}", response.status, detail).trim_end().to_string()
}

/// Classify one response into data or a failure class.
fn classify(response: &TransportResponse, context: &str) -> std::result::Result<Value, Failure> {
    let errors = parse_errors(&response.body);
    let success = (200..300).contains(&response.status);

    if success && errors.is_empty() {
        return match response.body.get("data") {
            Some(data) if !data.is_null() => Ok(data.clone()),
            _ => Err(Failure::Retryable(SyncError::unclassified(format!(
                "{}: response carried no data",
                context
            )))),
        };
    }

    let message = failure_message(response, &errors);

    if response.status == 429
        || errors.iter().any(GraphqlError::is_rate_limit)
        || message.to_lowercase().contains("rate limit")
    {
        return Err(Failure::RateLimited {
            signals: RateLimitSignals::from_response(response, &errors),
            message,
        });
    }

    let labelled = format!("{}: {}", context, message);
    if response.status >= 500 {
        return Err(Failure::Retryable(SyncError::transient(labelled)));
    }
    if response.status == 404 || errors.iter().any(GraphqlError::is_not_found) {
        return Err(Failure::Fatal(SyncError::not_found(labelled)));
    }
    if response.status == 401 || response.status == 403 {
        return Err(Failure::Fatal(SyncError::validation(labelled)));
    }
    Err(Failure::Retryable(SyncError::unclassified(labelled)))
}

/// Runs GraphQL queries with retry, backoff and rate-limit waiting
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn GraphqlTransport>,
    backoff: BackoffPolicy,
    rate_limit: RateLimitPolicy,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn GraphqlTransport>) -> Self {
        Self {
            transport,
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Execute `query` and decode its `data` object into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        options: ExecuteOptions,
    ) -> Result<T> {
        let data = self.execute_raw(query, variables, &options).await?;
        serde_json::from_value(data)
            .with_context(|| format!("Failed to decode response for {}", options.context))
    }

    /// Execute `query` and return its raw `data` object.
    pub async fn execute_raw(
        &self,
        query: &str,
        variables: Value,
        options: &ExecuteOptions,
    ) -> Result<Value> {
        let backoff = BackoffPolicy {
            max_attempts: options.max_attempts.unwrap_or(self.backoff.max_attempts),
            ..self.backoff
        };
        let request = GraphqlRequest {
            query: query.to_string(),
            variables,
        };

        let mut attempt = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            let outcome = match self.transport.send(&request).await {
                Ok(response) => classify(&response, &options.context),
                Err(err) => Err(Failure::Retryable(SyncError::transient(format!(
                    "{}: {:#}",
                    options.context, err
                )))),
            };

            match outcome {
                Ok(data) => {
                    debug!(context = %options.context, "Request succeeded");
                    return Ok(data);
                }
                Err(Failure::RateLimited { signals, message }) => {
                    if rate_limit_retries >= self.rate_limit.max_retries {
                        return Err(SyncError::rate_limited(format!(
                            "{}: {} (gave up after {} waits)",
                            options.context, message, rate_limit_retries
                        ))
                        .into());
                    }
                    rate_limit_retries += 1;
                    let wait = self.rate_limit.wait_for(&signals, Utc::now());
                    warn!(
                        context = %options.context,
                        attempt = rate_limit_retries,
                        max_attempts = self.rate_limit.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(Failure::Retryable(err)) => {
                    attempt += 1;
                    if !backoff.allows_retry(attempt) {
                        return Err(err.into());
                    }
                    let wait = backoff.delay_after(attempt);
                    warn!(
                        context = %options.context,
                        attempt,
                        max_attempts = backoff.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Request failed, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(Failure::Fatal(err)) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order.
    struct Replay {
        responses: Mutex<VecDeque<Result<TransportResponse>>>,
        calls: Mutex<u32>,
    }

    impl Replay {
        fn new(responses: Vec<Result<TransportResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GraphqlTransport for Replay {
        async fn send(&self, _request: &GraphqlRequest) -> Result<TransportResponse> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::ok(json!({ "data": { "ok": true } }))))
        }
    }

    fn rate_limited() -> TransportResponse {
        TransportResponse::ok(json!({
            "errors": [{ "type": "RATE_LIMITED", "message": "API rate limit exceeded" }]
        }))
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_retry_after_header_wait() {
        let policy = RateLimitPolicy::default();
        let signals = RateLimitSignals {
            retry_after: Some("120".to_string()),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()).as_millis(), 120_000);
    }

    #[test]
    fn test_default_wait_without_signals() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.wait_for(&RateLimitSignals::default(), now()).as_millis(),
            60_000
        );
    }

    #[test]
    fn test_short_signal_is_floored() {
        let policy = RateLimitPolicy::default();
        let signals = RateLimitSignals {
            retry_after: Some("10".to_string()),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()).as_millis(), 60_000);
    }

    #[test]
    fn test_signal_precedence() {
        let policy = RateLimitPolicy::default();
        let reset_in_5m = (now().timestamp() + 300).to_string();

        // reset header is used when Retry-After is absent
        let signals = RateLimitSignals {
            reset: Some(reset_in_5m.clone()),
            extension_delay: Some(json!(900)),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()), Duration::from_secs(300));

        // Retry-After beats everything
        let signals = RateLimitSignals {
            retry_after: Some("90".to_string()),
            reset: Some(reset_in_5m),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()), Duration::from_secs(90));

        // extension delay beats extension reset
        let signals = RateLimitSignals {
            extension_delay: Some(json!("180")),
            extension_reset: Some(json!("2024-06-01T13:00:00Z")),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()), Duration::from_secs(180));

        let signals = RateLimitSignals {
            extension_reset: Some(json!("2024-06-01T13:00:00Z")),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()), Duration::from_secs(3600));
    }

    #[test]
    fn test_unparseable_signal_falls_through() {
        let policy = RateLimitPolicy::default();
        let signals = RateLimitSignals {
            retry_after: Some("soon".to_string()),
            extension_delay: Some(json!(75)),
            ..Default::default()
        };
        assert_eq!(policy.wait_for(&signals, now()), Duration::from_secs(75));
    }

    #[test]
    fn test_signals_from_response() {
        let response = TransportResponse::ok(json!({}))
            .with_status(403)
            .with_header("X-RateLimit-Reset", "1717243500");
        let errors = vec![GraphqlError {
            message: "secondary rate limit".to_string(),
            error_type: None,
            extensions: Some(json!({ "retry_after": 30 })),
        }];

        let signals = RateLimitSignals::from_response(&response, &errors);
        assert_eq!(signals.retry_after, None);
        assert_eq!(signals.reset.as_deref(), Some("1717243500"));
        assert_eq!(signals.extension_delay, Some(json!(30)));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_classification() {
        let ok = TransportResponse::ok(json!({ "data": { "x": 1 } }));
        assert_eq!(classify(&ok, "t").unwrap(), json!({ "x": 1 }));

        let not_found = TransportResponse::ok(json!({
            "data": { "node": null },
            "errors": [{ "type": "NOT_FOUND", "message": "Could not resolve to a node" }]
        }));
        assert_matches!(
            classify(&not_found, "t"),
            Err(Failure::Fatal(SyncError::NotFound { .. }))
        );

        let bad_gateway = TransportResponse::ok(json!("<html>bad gateway</html>")).with_status(502);
        assert_matches!(
            classify(&bad_gateway, "t"),
            Err(Failure::Retryable(SyncError::Transient { .. }))
        );

        let unauthorized =
            TransportResponse::ok(json!({ "message": "Bad credentials" })).with_status(401);
        assert_matches!(
            classify(&unauthorized, "t"),
            Err(Failure::Fatal(SyncError::Validation { .. }))
        );

        let secondary = TransportResponse::ok(json!({
            "message": "You have exceeded a secondary Rate Limit"
        }))
        .with_status(403);
        assert_matches!(classify(&secondary, "t"), Err(Failure::RateLimited { .. }));

        let by_code = TransportResponse::ok(json!({
            "errors": [{ "message": "slow down", "extensions": { "code": "graphql_rate_limit" } }]
        }));
        assert_matches!(classify(&by_code, "t"), Err(Failure::RateLimited { .. }));

        let other = TransportResponse::ok(json!({ "errors": [{ "message": "Something went wrong" }] }));
        assert_matches!(
            classify(&other, "t"),
            Err(Failure::Retryable(SyncError::Unclassified { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_default_and_retries() {
        let transport = Replay::new(vec![Ok(rate_limited())]);
        let executor = RequestExecutor::new(transport.clone());

        let started = tokio::time::Instant::now();
        let data = executor
            .execute_raw("query Q { x }", json!({}), &ExecuteOptions::new("test"))
            .await
            .unwrap();

        assert_eq!(data, json!({ "ok": true }));
        assert_eq!(transport.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_do_not_consume_attempts() {
        let transport = Replay::new(vec![
            Ok(rate_limited()),
            Ok(rate_limited()),
            Ok(rate_limited()),
            Ok(rate_limited()),
            Ok(TransportResponse::ok(json!("oops")).with_status(503)),
        ]);
        let executor = RequestExecutor::new(transport.clone());

        let options = ExecuteOptions::new("test").max_attempts(2);
        executor
            .execute_raw("query Q { x }", json!({}), &options)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_budget_exhausted() {
        let responses = (0..=MAX_RATE_LIMIT_RETRIES).map(|_| Ok(rate_limited())).collect();
        let transport = Replay::new(responses);
        let executor = RequestExecutor::new(transport.clone());

        let err = executor
            .execute_raw("query Q { x }", json!({}), &ExecuteOptions::new("test"))
            .await
            .unwrap_err();
        assert_matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RateLimited { .. })
        );
        assert_eq!(transport.calls(), MAX_RATE_LIMIT_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_give_up() {
        let transport = Replay::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Ok(TransportResponse::ok(json!("oops")).with_status(500)),
            Ok(TransportResponse::ok(json!("oops")).with_status(502)),
        ]);
        let executor = RequestExecutor::new(transport.clone());

        let started = tokio::time::Instant::now();
        let err = executor
            .execute_raw("query Q { x }", json!({}), &ExecuteOptions::new("issues acme/api"))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 3);
        // 500ms + 1s between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Transient { .. }));
        assert!(err.to_string().contains("issues acme/api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let transport = Replay::new(vec![Ok(TransportResponse::ok(json!({
            "data": { "node": null },
            "errors": [{ "type": "NOT_FOUND", "message": "gone" }]
        })))]);
        let executor = RequestExecutor::new(transport.clone());

        let err = executor
            .execute_raw("query Q { x }", json!({}), &ExecuteOptions::new("comments"))
            .await
            .unwrap_err();
        assert!(crate::error::is_not_found(&err));
        assert_eq!(transport.calls(), 1);
    }
}
