//! ErrorClassifier - maps transport outcomes onto the canonical taxonomy
//!
//! Pure functions with no state. Every failure the dispatcher observes goes
//! through here exactly once.

use std::collections::BTreeMap;

use af_common::{ClassifiedError, ErrorKind, Response, ResponseType, TransportError};
use serde_json::Value;

/// Kind for a non-success HTTP status, `None` for 1xx-3xx
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 => Some(ErrorKind::Authentication),
        403 => Some(ErrorKind::Authorization),
        400 | 422 => Some(ErrorKind::Validation),
        429 => Some(ErrorKind::RateLimited),
        500..=599 => Some(ErrorKind::ServerError),
        400..=499 => Some(ErrorKind::ClientError),
        _ => None,
    }
}

pub fn is_retryable(kind: ErrorKind) -> bool {
    kind.is_retryable()
}

pub fn is_retryable_status(status: u16) -> bool {
    classify_status(status).map(|k| k.is_retryable()).unwrap_or(false)
}

/// Classify either side of a transport call for a JSON request. `None`
/// means success.
pub fn classify(outcome: &Result<Response, TransportError>) -> Option<ClassifiedError> {
    match outcome {
        Ok(response) => classify_response(response, ResponseType::Json),
        Err(err) => Some(classify_transport_error(err)),
    }
}

pub fn classify_transport_error(err: &TransportError) -> ClassifiedError {
    ClassifiedError::from(err.clone())
}

/// Classify a received response. When `expected` is Json, a 2xx envelope
/// reporting `"success": false` is a BusinessLogic failure.
pub fn classify_response(response: &Response, expected: ResponseType) -> Option<ClassifiedError> {
    let body = response.json_value();

    let kind = match classify_status(response.status) {
        Some(kind) => kind,
        None => {
            let rejected = expected == ResponseType::Json
                && response.is_success()
                && body
                    .as_ref()
                    .and_then(|b| b.get("success"))
                    .and_then(Value::as_bool)
                    == Some(false);
            if !rejected {
                return None;
            }
            ErrorKind::BusinessLogic
        }
    };

    let server_message = body.as_ref().and_then(server_message);
    let message = server_message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", response.status));

    let mut error = ClassifiedError::new(kind, message).with_status(response.status);
    if let Some(text) = server_message {
        error = error.with_user_message(text);
    }

    match kind {
        ErrorKind::Validation => {
            if let Some(fields) = body.as_ref().and_then(field_errors) {
                error = error.with_field_errors(fields);
            }
        }
        ErrorKind::RateLimited => {
            error = error.with_retry_after(response.retry_after());
        }
        _ => {}
    }

    Some(error)
}

/// First of `message`, `error` (string or `{message}`) and `detail`
fn server_message(body: &Value) -> Option<String> {
    let text = |v: &Value| v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(String::from);

    if let Some(msg) = body.get("message").and_then(text) {
        return Some(msg);
    }
    if let Some(err) = body.get("error") {
        if let Some(msg) = text(err).or_else(|| err.get("message").and_then(text)) {
            return Some(msg);
        }
    }
    body.get("detail").and_then(text)
}

/// Accepts `{"errors": {"field": "msg" | ["msg", ...]}}` and
/// `{"errors": [{"field": "...", "message": "..."}]}`
fn field_errors(body: &Value) -> Option<BTreeMap<String, Vec<String>>> {
    let errors = body.get("errors")?;
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();

    match errors {
        Value::Object(map) => {
            for (field, messages) in map {
                let entry = fields.entry(field.clone()).or_default();
                match messages {
                    Value::String(s) => entry.push(s.clone()),
                    Value::Array(items) => {
                        entry.extend(items.iter().filter_map(Value::as_str).map(String::from))
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let field = item.get("field").and_then(Value::as_str);
                let message = item.get("message").and_then(Value::as_str);
                if let (Some(field), Some(message)) = (field, message) {
                    fields.entry(field.to_string()).or_default().push(message.to_string());
                }
            }
        }
        _ => return None,
    }

    fields.retain(|_, v| !v.is_empty());
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}
