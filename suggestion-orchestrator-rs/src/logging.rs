//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Records emitted through the
//! `log` facade (the provider SDK logs that way) are bridged into it.

use std::sync::atomic::{AtomicBool, Ordering};

use provider_sdk::{ConfigProvider, ConfigProviderExt};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{OrchestratorError, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "suggestion-orchestrator".to_string(),
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Read `log_level`, `service_name` and `log_json`
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Self {
        let defaults = Self::default();
        Self {
            level: provider.get_string_or("log_level", &defaults.level),
            service_name: provider.get_string_or("service_name", &defaults.service_name),
            json_format: provider.get_bool_or("log_json", defaults.json_format),
        }
    }
}

/// Initializes the structured logging system.
///
/// Calling it again after a successful initialization is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let subscriber = Registry::default().with(filter);

    let installed = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(true);

        subscriber.with(json_layer).try_init()
    } else {
        let text_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true);

        subscriber.with(text_layer).try_init()
    };

    installed.map_err(|e| {
        OrchestratorError::configuration(format!("Failed to set global subscriber: {}", e))
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Whether [`init_logging`] has completed
pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}
