//! Tests for error handling functionality
//!
//! These tests verify that the error system in the SDK works correctly.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::error::{mapping, ErrorContext, ErrorKind, ServiceError};

    #[test]
    fn test_service_error_creation() {
        let network_err = ServiceError::network("Connection failed");
        let auth_err = ServiceError::authentication("Invalid credentials");
        let rate_limit_err = ServiceError::rate_limit("Too many requests");

        assert_eq!(network_err.to_string(), "Network error: Connection failed");
        assert_eq!(auth_err.to_string(), "Authentication error: Invalid credentials");
        assert_eq!(rate_limit_err.to_string(), "Rate limit exceeded: Too many requests");

        assert!(network_err.is_retryable());
        assert!(!auth_err.is_retryable());
        assert!(rate_limit_err.is_retryable());
        assert!(auth_err.is_permanent());
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(ServiceError::timeout("t").kind(), ErrorKind::Timeout);
        assert_eq!(ServiceError::rate_limit("r").kind(), ErrorKind::RateLimited);
        assert_eq!(ServiceError::circuit_broken("c").kind(), ErrorKind::ProviderUnavailable);
        assert_eq!(ServiceError::parsing("p").kind(), ErrorKind::InvalidResponse);
        assert_eq!(ServiceError::network("n").kind(), ErrorKind::TransientNetwork);
        assert_eq!(ServiceError::service("s").kind(), ErrorKind::TransientNetwork);
        assert_eq!(ServiceError::validation("v").kind(), ErrorKind::Rejected);
        assert_eq!(ServiceError::configuration("c").kind(), ErrorKind::Rejected);

        // An open breaker must not be retried
        assert!(!ServiceError::circuit_broken("open").is_retryable());
        assert!(!ServiceError::parsing("bad json").is_retryable());
    }

    #[test]
    fn test_error_context() {
        let context = ErrorContext::for_service("vision")
            .status_code(503)
            .request_id("req-123")
            .endpoint("vision/analyze")
            .with("attempt", 3);

        let err = ServiceError::service("unavailable").with_context(context);

        assert_eq!(err.service_name(), Some("vision"));
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        assert!(err.to_string().contains("unavailable"));

        let err = err.with_context_value("extra", "value");
        let data = &err.context().unwrap().data;
        assert_eq!(data.get("attempt").map(String::as_str), Some("3"));
        assert_eq!(data.get("extra").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_status_mapping() {
        let mut context = ErrorContext::for_service("generation");
        let cases = [
            (StatusCode::BAD_REQUEST, ErrorKind::Rejected),
            (StatusCode::UNAUTHORIZED, ErrorKind::Rejected),
            (StatusCode::FORBIDDEN, ErrorKind::Rejected),
            (StatusCode::NOT_FOUND, ErrorKind::Rejected),
            (StatusCode::REQUEST_TIMEOUT, ErrorKind::Timeout),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimited),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::TransientNetwork),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorKind::TransientNetwork),
        ];

        for (status, expected) in cases {
            let err = mapping::map_http_error(status, "", &mut context);
            assert_eq!(err.kind(), expected, "status {}", status);
            assert_eq!(mapping::is_retryable_status(status), expected.is_transient());
        }

        assert!(matches!(
            mapping::map_http_error(StatusCode::UNAUTHORIZED, "", &mut context),
            ServiceError::Authentication(_)
        ));
        assert!(matches!(
            mapping::map_http_error(StatusCode::FORBIDDEN, "", &mut context),
            ServiceError::Authorization(_)
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        let mut context = ErrorContext::for_service("generation");
        let body = r#"{"error": {"message": "model overloaded", "type": "server_error", "code": "overloaded"}}"#;
        let err = mapping::map_http_error(StatusCode::SERVICE_UNAVAILABLE, body, &mut context);
        assert_eq!(err.to_string(), "Service error: model overloaded");
        assert_eq!(context.error_code.as_deref(), Some("overloaded"));
        assert_eq!(context.data.get("error_type").map(String::as_str), Some("server_error"));

        let mut context = ErrorContext::for_service("speech");
        let body = r#"{"detail": {"status": "quota_exceeded", "message": "quota exceeded"}}"#;
        let err = mapping::map_http_error(StatusCode::UNAUTHORIZED, body, &mut context);
        assert_eq!(err.to_string(), "Authentication error: quota exceeded");
        assert_eq!(context.error_code.as_deref(), Some("quota_exceeded"));

        let long_body = "x".repeat(300);
        let err = mapping::map_http_error(StatusCode::BAD_GATEWAY, &long_body, &mut context);
        assert!(err.to_string().len() < 150);
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ServiceError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        assert_eq!(err.service_name(), Some("json"));
    }
}
