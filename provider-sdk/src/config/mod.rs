//! Configuration management for provider clients
//!
//! This module provides utilities for loading and validating configuration
//! for the external providers, with support for environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::core::ProviderKind;
use crate::error::{Result, ServiceError};
use crate::resilience::CircuitBreakerConfig;

/// Base trait for configuration providers
pub trait ConfigProvider: Send + Sync {
    /// Get a string configuration value
    fn get_string(&self, key: &str) -> Result<String>;
}

/// Extension methods for configuration providers
pub trait ConfigProviderExt: ConfigProvider {
    /// Get an integer configuration value
    fn get_int(&self, key: &str) -> Result<i64> {
        let value = self.get_string(key)?;
        value.trim().parse::<i64>().map_err(|e| {
            ServiceError::configuration(format!("Invalid integer for key {}: {}", key, e))
        })
    }

    /// Get a float configuration value
    fn get_float(&self, key: &str) -> Result<f64> {
        let value = self.get_string(key)?;
        value.trim().parse::<f64>().map_err(|e| {
            ServiceError::configuration(format!("Invalid float for key {}: {}", key, e))
        })
    }

    /// Get a boolean configuration value
    fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.get_string(key)?;
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(ServiceError::configuration(format!(
                "Invalid boolean value for key {}: {}",
                key, value
            ))),
        }
    }

    /// Get a duration such as `"250ms"`, `"30s"` or `"5m"`
    fn get_duration(&self, key: &str) -> Result<Duration> {
        let value = self.get_string(key)?;
        crate::util::parse_duration(&value).ok_or_else(|| {
            ServiceError::configuration(format!("Invalid duration for key {}: {}", key, value))
        })
    }

    /// Get a string configuration value with a default
    fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|_| default.to_string())
    }

    /// Get an integer configuration value with a default
    fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    /// Get a float configuration value with a default
    fn get_float_or(&self, key: &str, default: f64) -> f64 {
        self.get_float(key).unwrap_or(default)
    }

    /// Get a boolean configuration value with a default
    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get a duration with a default
    fn get_duration_or(&self, key: &str, default: Duration) -> Duration {
        self.get_duration(key).unwrap_or(default)
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProviderExt for T {}

/// Environment variable based configuration provider
#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    /// Optional prefix for environment variables
    prefix: Option<String>,

    /// Optional namespace for variables (e.g., "VISION", "SPEECH")
    namespace: Option<String>,
}

impl EnvConfigProvider {
    /// Create a new environment variable config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a prefix for environment variables
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set a namespace for environment variables
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Format a configuration key as an environment variable
    pub(crate) fn format_key(&self, key: &str) -> String {
        let mut env_key = String::new();

        if let Some(ref prefix) = self.prefix {
            env_key.push_str(prefix);
            env_key.push('_');
        }

        if let Some(ref namespace) = self.namespace {
            env_key.push_str(namespace);
            env_key.push('_');
        }

        env_key.push_str(
            &key.to_uppercase()
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_"),
        );

        env_key
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_string(&self, key: &str) -> Result<String> {
        let env_key = self.format_key(key);

        env::var(&env_key).map_err(|e| match e {
            env::VarError::NotPresent => {
                ServiceError::configuration(format!("Environment variable not set: {}", env_key))
            }
            env::VarError::NotUnicode(_) => ServiceError::configuration(format!(
                "Environment variable is not valid unicode: {}",
                env_key
            )),
        })
    }
}

/// In-memory config provider for testing or static configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigProvider {
    values: HashMap<String, String>,
}

impl MemoryConfigProvider {
    /// Create a new empty memory config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory config provider with initial values
    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Set a configuration value
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: ToString,
    {
        self.values.insert(key.into(), value.to_string());
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn get_string(&self, key: &str) -> Result<String> {
        self.values.get(key).cloned().ok_or_else(|| {
            ServiceError::configuration(format!("Configuration key not found: {}", key))
        })
    }
}

/// A composite config provider that tries multiple providers in order
#[derive(Default)]
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    /// Create a new composite config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider to the end of the chain
    pub fn add_provider(&mut self, provider: impl ConfigProvider + 'static) {
        self.providers.push(Box::new(provider));
    }

    /// Builder form of [`add_provider`](Self::add_provider)
    pub fn with_provider(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.add_provider(provider);
        self
    }
}

impl ConfigProvider for CompositeConfigProvider {
    fn get_string(&self, key: &str) -> Result<String> {
        self.providers
            .iter()
            .find_map(|provider| provider.get_string(key).ok())
            .ok_or_else(|| {
                ServiceError::configuration(format!(
                    "Configuration key not found in any provider: {}",
                    key
                ))
            })
    }
}

/// Global default configuration provider
pub static DEFAULT_PROVIDER: Lazy<Arc<EnvConfigProvider>> =
    Lazy::new(|| Arc::new(EnvConfigProvider::new().with_prefix("SUGGEST")));

/// Trait for provider-specific configuration
pub trait ServiceConfig: Debug + Send + Sync {
    /// Validate this configuration
    fn validate(&self) -> Result<()>;

    /// Service name
    fn service_name(&self) -> &str;
}

/// Endpoint, credentials and breaker settings for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    /// Which provider this configures
    pub kind: ProviderKind,

    /// API key sent with every request
    pub api_key: String,

    /// Base URL (can be changed for proxies and tests)
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// HTTP client timeout in seconds
    pub timeout_seconds: u64,

    /// Default voice for speech synthesis
    pub voice_id: Option<String>,

    /// Consecutive transient failures before the breaker opens
    pub failure_threshold: u32,

    /// Breaker cooldown in seconds
    pub cooldown_seconds: u64,
}

impl ProviderEndpointConfig {
    /// Defaults for a provider, without an API key
    pub fn defaults(kind: ProviderKind) -> Self {
        let breaker = kind.default_breaker_config();
        let (base_url, model, voice_id) = match kind {
            ProviderKind::Vision => (
                "https://generativelanguage.googleapis.com/v1beta",
                "gemini-2.5-pro",
                None,
            ),
            ProviderKind::Generation => ("https://api.x.ai/v1", "grok-4-fast", None),
            ProviderKind::Speech => (
                "https://api.elevenlabs.io/v1",
                "eleven_monolingual_v1",
                Some("21m00Tcm4TlvDq8ikWAM".to_string()),
            ),
        };

        Self {
            kind,
            api_key: String::new(),
            base_url: base_url.to_string(),
            model: model.to_string(),
            timeout_seconds: 30,
            voice_id,
            failure_threshold: breaker.failure_threshold,
            cooldown_seconds: breaker.cooldown.as_secs(),
        }
    }

    /// Load configuration from a config provider.
    ///
    /// Keys are `{kind}_api_key`, `{kind}_base_url`, `{kind}_model`,
    /// `{kind}_timeout_seconds`, `{kind}_voice_id`,
    /// `{kind}_failure_threshold` and `{kind}_cooldown_seconds`.
    pub fn from_provider<P: ConfigProvider + ?Sized>(kind: ProviderKind, provider: &P) -> Result<Self> {
        let defaults = Self::defaults(kind);
        let key = |suffix: &str| format!("{}_{}", kind.as_str(), suffix);

        let config = Self {
            kind,
            api_key: provider.get_string(&key("api_key"))?,
            base_url: provider.get_string_or(&key("base_url"), &defaults.base_url),
            model: provider.get_string_or(&key("model"), &defaults.model),
            timeout_seconds: provider
                .get_int_or(&key("timeout_seconds"), defaults.timeout_seconds as i64)
                .max(1) as u64,
            voice_id: provider.get_string(&key("voice_id")).ok().or(defaults.voice_id),
            failure_threshold: provider
                .get_int_or(&key("failure_threshold"), defaults.failure_threshold as i64)
                .max(1) as u32,
            cooldown_seconds: provider
                .get_int_or(&key("cooldown_seconds"), defaults.cooldown_seconds as i64)
                .max(1) as u64,
        };

        config.validate()?;
        Ok(config)
    }

    /// HTTP client timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Breaker configuration derived from this endpoint
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_seconds),
            ..self.kind.default_breaker_config()
        }
    }

    /// Join a path onto the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl ServiceConfig for ProviderEndpointConfig {
    fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ServiceError::configuration(format!(
                "{} API key is required",
                self.kind
            )));
        }

        if self.base_url.is_empty() {
            return Err(ServiceError::configuration(format!(
                "{} base URL is required",
                self.kind
            )));
        }

        url::Url::parse(&self.base_url).map_err(|e| {
            ServiceError::configuration(format!(
                "Invalid {} base URL {}: {}",
                self.kind, self.base_url, e
            ))
        })?;

        if self.model.is_empty() {
            return Err(ServiceError::configuration(format!(
                "{} model is required",
                self.kind
            )));
        }

        Ok(())
    }

    fn service_name(&self) -> &str {
        self.kind.as_str()
    }
}
