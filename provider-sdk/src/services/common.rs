//! Common utilities for provider clients
//!
//! This module provides shared functionality for all provider clients.

use std::fmt;

use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ErrorContext, Result, ServiceError};

/// UserAgent structure for identifying the client to upstream providers
#[derive(Debug, Clone)]
pub struct UserAgent {
    /// Application name
    pub app_name: String,

    /// Version string
    pub version: String,

    /// Optional extra info
    pub extra: Option<String>,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            app_name: "suggestion-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            extra: Some("provider-sdk".to_string()),
        }
    }
}

impl UserAgent {
    /// User agent naming a specific client
    pub fn for_client(client: &str) -> Self {
        Self {
            extra: Some(format!("{}-client", client)),
            ..Self::default()
        }
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_name, self.version)?;

        if let Some(ref extra) = self.extra {
            write!(f, " ({})", extra)?;
        }

        Ok(())
    }
}

/// Create error context for HTTP requests
pub fn create_error_context(
    service_name: &str,
    endpoint: &str,
    status: Option<reqwest::StatusCode>,
) -> ErrorContext {
    let mut context = ErrorContext::for_service(service_name).endpoint(endpoint);

    if let Some(status_code) = status {
        context = context.status_code(status_code.as_u16());
    }

    context
}

/// Parse error response from HTTP response
pub async fn parse_error_response(
    service_name: &str,
    endpoint: &str,
    response: Response,
) -> ServiceError {
    let status = response.status();
    let mut context = create_error_context(service_name, endpoint, Some(status));

    if let Some(request_id) = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
    {
        context = context.request_id(request_id);
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => format!("Failed to read error response: {}", e),
    };
    log::debug!(
        "{} returned {}: {}",
        service_name,
        status,
        crate::util::sanitize_for_logging(&crate::util::truncate_string(&body, 500))
    );

    crate::error::mapping::map_http_error(status, &body, &mut context).with_context(context)
}

/// Tag transport-level failures with the provider they came from
pub fn transport_error(service_name: &str, endpoint: &str, err: reqwest::Error) -> ServiceError {
    match ServiceError::from(err) {
        ServiceError::WithContext { inner, context } => ServiceError::WithContext {
            inner,
            context: ErrorContext {
                service: service_name.to_string(),
                endpoint: Some(endpoint.to_string()),
                ..context
            },
        },
        other => other,
    }
}

/// POST a JSON body and decode a JSON response
pub async fn post_json<T, R>(
    client: &Client,
    service_name: &str,
    url: &str,
    body: &T,
) -> Result<R>
where
    T: Serialize + ?Sized,
    R: DeserializeOwned,
{
    log::debug!("Sending request to {}: POST {}", service_name, url);

    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| transport_error(service_name, url, e))?;

    if !response.status().is_success() {
        return Err(parse_error_response(service_name, url, response).await);
    }

    let text = response
        .text()
        .await
        .map_err(|e| transport_error(service_name, url, e))?;

    serde_json::from_str::<R>(&text).map_err(|e| {
        ServiceError::parsing(format!("Failed to parse {} response: {}", service_name, e))
            .with_context(create_error_context(service_name, url, None))
    })
}
