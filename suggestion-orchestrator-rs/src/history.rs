//! Request history
//!
//! Every answered request produces one [`HistoryRecord`]. Records are handed
//! to a [`HistorySink`] on a spawned task so persistence never delays the
//! response.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{ResponseStatus, Tier};

/// What was answered, for the user's history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub correlation_id: String,
    pub fingerprint: String,
    pub tier: Tier,
    pub status: ResponseStatus,
    pub cache_hit: bool,
    pub suggestion_ids: Vec<String>,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> Result<()>;
}

/// Writes records to the log
#[derive(Debug, Default, Clone)]
pub struct LoggingHistorySink;

#[async_trait]
impl HistorySink for LoggingHistorySink {
    async fn record(&self, record: HistoryRecord) -> Result<()> {
        info!(
            correlation_id = %record.correlation_id,
            fingerprint = %record.fingerprint,
            tier = %record.tier,
            status = record.status.as_str(),
            cache_hit = record.cache_hit,
            suggestions = record.suggestion_ids.len(),
            latency_ms = record.latency_ms,
            "Suggestion history"
        );
        Ok(())
    }
}

/// Hand a record to the sink without waiting for it
pub(crate) fn record_detached(sink: &Arc<dyn HistorySink>, record: HistoryRecord) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        let correlation_id = record.correlation_id.clone();
        if let Err(e) = sink.record(record).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to record history");
        }
    });
}
