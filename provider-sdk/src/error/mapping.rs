//! Error mapping for provider APIs
//!
//! Converts provider error responses (status code plus body) into the
//! normalized `ServiceError` type.

use reqwest::StatusCode;
use serde_json::Value;

use super::{ErrorContext, ServiceError};

/// Pull a human readable message out of a provider error body.
///
/// Understands the OpenAI-style `{"error": {"message": ..}}` envelope, the
/// flat `{"error": ".."}` / `{"message": ".."}` shapes and the
/// `{"detail": {"message": ..}}` shape used by the speech provider.
fn extract_message(json: &Value, context: &mut ErrorContext) -> Option<String> {
    if let Some(error) = json.get("error") {
        if let Some(message) = error.as_str() {
            return Some(message.to_string());
        }

        if let Some(error_type) = error.get("type").and_then(|t| t.as_str()) {
            context.add("error_type", error_type);
        }
        if let Some(code) = error.get("code").and_then(|c| c.as_str()) {
            context.error_code = Some(code.to_string());
        }
        if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
            return Some(message.to_string());
        }
    }

    if let Some(detail) = json.get("detail") {
        if let Some(status) = detail.get("status").and_then(|s| s.as_str()) {
            context.error_code = Some(status.to_string());
        }
        if let Some(message) = detail
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| detail.as_str())
        {
            return Some(message.to_string());
        }
    }

    json.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// Map a status code and message to the matching error variant
pub fn error_for_status(status: StatusCode, message: impl Into<String>) -> ServiceError {
    let message = message.into();
    match status.as_u16() {
        400 => ServiceError::validation(message),
        401 => ServiceError::authentication(message),
        403 => ServiceError::authorization(message),
        404 => ServiceError::validation(format!("Resource not found: {}", message)),
        408 => ServiceError::timeout(message),
        429 => ServiceError::rate_limit(message),
        500..=599 => ServiceError::service(message),
        // Remaining client errors are our fault and must not be retried
        402..=499 => ServiceError::validation(message),
        _ => ServiceError::service(message),
    }
}

/// Map a provider HTTP error response to a ServiceError
pub fn map_http_error(status: StatusCode, body: &str, context: &mut ErrorContext) -> ServiceError {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(message) = extract_message(&json, context) {
            return error_for_status(status, message);
        }
    }

    let message = if body.is_empty() {
        status.to_string()
    } else if body.len() > 100 {
        format!("{}: {}", status, crate::util::truncate_string(body, 100))
    } else {
        format!("{}: {}", status, body)
    };

    error_for_status(status, message)
}

/// Determine if an HTTP status code indicates a retryable error
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}
