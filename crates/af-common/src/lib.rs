use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod events;

pub use events::{ApiEvent, DismissReason, EventBus, LoadingKind, NoticeKind};

// ============================================================================
// Request Types
// ============================================================================

/// Identifier assigned to every dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the caller wants the response body interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Bytes,
}

// ============================================================================
// Response Types
// ============================================================================

/// Raw response returned by a transport
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: IndexMap<String, String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Build a response with a JSON body
    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Parsed JSON body, `None` when the body is empty or not JSON
    pub fn json_value(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Retry-After header as a delay, accepting delta-seconds or an HTTP date
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.header("retry-after")?.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
        let delta = at - Utc::now();
        Some(delta.to_std().unwrap_or(Duration::ZERO))
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Canonical classification of a failure's cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Aborted,
    Authentication,
    Authorization,
    Validation,
    RateLimited,
    ServerError,
    ClientError,
    BusinessLogic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::BusinessLogic => "business_logic",
        }
    }

    /// Transient kinds that a retry may resolve.
    /// Authentication is excluded: the token manager owns that recovery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::RateLimited
        )
    }

    /// Fallback text shown when the server supplies no message
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Unable to reach the server. Check your connection and try again.",
            ErrorKind::Timeout => "The request took too long. Please try again.",
            ErrorKind::Aborted => "The request was cancelled.",
            ErrorKind::Authentication => "Your session has expired. Please sign in again.",
            ErrorKind::Authorization => "You do not have permission to perform this action.",
            ErrorKind::Validation => "Some fields are invalid. Please review your input.",
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.",
            ErrorKind::ServerError => "The server encountered an error. Please try again later.",
            ErrorKind::ClientError => "The request could not be completed.",
            ErrorKind::BusinessLogic => "The operation could not be completed.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transport before any HTTP status was received
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport timed out")]
    Timeout,

    #[error("Request aborted")]
    Aborted,
}

/// A failure mapped onto the canonical taxonomy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
    pub user_message: String,
    pub retryable: bool,
    pub context: BTreeMap<String, String>,
    /// Field name to messages, populated for Validation errors
    pub field_errors: BTreeMap<String, Vec<String>>,
    /// Server-provided delay hint, populated for RateLimited errors
    pub retry_after: Option<Duration>,
    /// Number of attempts made before this error surfaced
    pub attempts: u32,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
            user_message: kind.default_user_message().to_string(),
            retryable: kind.is_retryable(),
            context: BTreeMap::new(),
            field_errors: BTreeMap::new(),
            retry_after: None,
            attempts: 0,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, reason)
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("Request exceeded {}ms", budget.as_millis()))
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message).with_status(401)
    }

    pub fn business(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::BusinessLogic, message.clone()).with_user_message(message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_field_errors(mut self, fields: BTreeMap<String, Vec<String>>) -> Self {
        self.field_errors = fields;
        self
    }

    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }
}

impl From<TransportError> for ClassifiedError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(reason) => ClassifiedError::new(ErrorKind::Network, reason),
            TransportError::Timeout => ClassifiedError::new(ErrorKind::Timeout, "Transport timed out"),
            TransportError::Aborted => ClassifiedError::aborted("Request aborted by transport"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let resp = Response::new(200, IndexMap::new(), Bytes::new())
            .with_header("Content-Type", "application/json");
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let resp = Response::new(429, IndexMap::new(), Bytes::new()).with_header("Retry-After", "7");
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_past_http_date_is_zero() {
        let resp = Response::new(429, IndexMap::new(), Bytes::new())
            .with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(resp.retry_after(), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_garbage() {
        let resp = Response::new(429, IndexMap::new(), Bytes::new()).with_header("Retry-After", "soon");
        assert_eq!(resp.retry_after(), None);
    }

    #[test]
    fn test_kind_retryable_table() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::Authorization.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::BusinessLogic.is_retryable());
        assert!(!ErrorKind::Aborted.is_retryable());
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: ClassifiedError = TransportError::Network("connection refused".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);
        assert_eq!(err.user_message, ErrorKind::Network.default_user_message());

        let err: ClassifiedError = TransportError::Aborted.into();
        assert!(err.is_aborted());
    }

    #[test]
    fn test_business_error_uses_message_for_user() {
        let err = ClassifiedError::business("Insufficient stock");
        assert_eq!(err.kind, ErrorKind::BusinessLogic);
        assert_eq!(err.user_message, "Insufficient stock");
        assert!(!err.retryable);
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId(42).to_string(), "req-42");
    }
}
