//! Client builder implementation
//!
//! Provides a unified builder for the HTTP clients behind each provider.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as ReqwestClient;

use crate::config::ProviderEndpointConfig;
use crate::error::{Result, ServiceError};
use crate::services::common::UserAgent;

/// How the API key is presented to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// The key goes verbatim into the named header
    Header(String),
}

/// Unified client builder for all provider clients
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    auth_token: Option<String>,
    auth_scheme: AuthScheme,
    custom_headers: HashMap<String, String>,
    timeout: Option<Duration>,
    user_agent: UserAgent,
    compression: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            auth_token: None,
            auth_scheme: AuthScheme::Bearer,
            custom_headers: HashMap::new(),
            timeout: Some(Duration::from_secs(30)),
            user_agent: UserAgent::default(),
            compression: true,
        }
    }
}

impl ClientBuilder {
    /// Create a new client builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with an endpoint's key and timeout
    pub fn for_endpoint(config: &ProviderEndpointConfig) -> Self {
        Self::new()
            .auth_token(config.api_key.clone())
            .timeout(config.timeout())
            .user_agent(UserAgent::for_client(config.kind.as_str()))
    }

    /// Set authentication token/key
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set how the token is sent
    pub fn auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    /// Add a custom header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    /// Set request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set user agent
    pub fn user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Enable or disable compression
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Build an HTTP client with the configured settings
    pub fn build_http_client(&self) -> Result<ReqwestClient> {
        let mut builder = ReqwestClient::builder()
            .user_agent(self.user_agent.to_string())
            .gzip(self.compression);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &self.custom_headers {
            let header_name = HeaderName::from_str(key)
                .map_err(|e| ServiceError::configuration(format!("Invalid header name: {}", e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ServiceError::configuration(format!("Invalid header value: {}", e)))?;
            headers.insert(header_name, header_value);
        }

        if let Some(ref token) = self.auth_token {
            let (name, value) = match &self.auth_scheme {
                AuthScheme::Bearer => (
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", token),
                ),
                AuthScheme::Header(name) => (
                    HeaderName::from_str(name).map_err(|e| {
                        ServiceError::configuration(format!("Invalid auth header name: {}", e))
                    })?,
                    token.clone(),
                ),
            };

            let mut value = HeaderValue::from_str(&value)
                .map_err(|e| ServiceError::configuration(format!("Invalid auth header: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        builder
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::configuration(format!("Failed to build HTTP client: {}", e)))
    }
}
