use std::time::Duration;

use af_common::{Method, ResponseType};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;

use crate::retry::RetryPolicy;

/// Everything needed to perform one logical request.
///
/// Interceptors take a config by value and return a new one; once admitted
/// the dispatcher holds it behind an `Arc` and never mutates it.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    pub url: String,
    pub method: Method,
    pub headers: IndexMap<String, String>,
    pub body: Option<Bytes>,
    /// Total budget across every attempt; client default when `None`
    pub timeout: Option<Duration>,
    /// Client default when `None`
    pub retry_policy: Option<RetryPolicy>,
    /// Concurrent requests sharing a key share one transport call
    pub dedupe_key: Option<String>,
    /// Scheduler used for admission; default group when `None`
    pub concurrency_group: Option<String>,
    pub response_type: ResponseType,
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Replace any header with the same name, ignoring case
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        self.headers.insert(key, value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the body and mark it as JSON
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.body = Some(Bytes::from(body));
        if self.header("content-type").is_none() {
            self.set_header("Content-Type", "application/json");
        }
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Single attempt, no retries
    pub fn without_retry(self) -> Self {
        self.with_retry_policy(RetryPolicy::none())
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_concurrency_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Join a relative URL onto a base. Absolute URLs are left untouched.
pub fn join_url(base: Option<&str>, url: &str) -> String {
    match base {
        Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
            let base = base.trim_end_matches('/');
            let path = url.trim_start_matches('/');
            if path.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", base, path)
            }
        }
        _ => url.to_string(),
    }
}
