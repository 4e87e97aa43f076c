//! # Streaming Delivery
//!
//! One session per streaming request. The producer side ([`StreamHandle`])
//! pushes events into a bounded channel; the consumer side
//! ([`StreamReceiver`]) reads them with an idle timeout.
//!
//! Session states: `active -> completed | cancelled | errored`. The first
//! terminal transition wins and removes the session from the registry.
//!
//! While the pipeline works, the producer reports each [`PipelinePhase`] it
//! enters as a `progress` event, so a healthy stream is never idle for
//! longer than one phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::quality;
use crate::types::{PipelinePhase, ResponseMeta, Suggestion};

/// Order in which a batch of suggestions is streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Highest confidence first
    #[default]
    Ranked,
    /// As produced
    Arrival,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub ordering: OrderingMode,
    /// Overrides the configured idle timeout
    pub idle_timeout: Option<Duration>,
}

impl StreamOptions {
    pub fn arrival_order() -> Self {
        Self {
            ordering: OrderingMode::Arrival,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Cancelled,
    Errored,
}

/// What the client sees
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum StreamEvent {
    Started {
        stream_id: String,
        correlation_id: String,
        estimated_duration_ms: u64,
        phases: Vec<PipelinePhase>,
    },
    /// The pipeline entered `phase`; `progress` is percent complete
    Progress {
        phase: PipelinePhase,
        progress: u8,
    },
    Chunk {
        index: usize,
        suggestion: Suggestion,
    },
    Completed {
        meta: ResponseMeta,
    },
    Errored {
        reason: String,
    },
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Completed { .. } | StreamEvent::Errored { .. } | StreamEvent::Cancelled
        )
    }
}

/// Snapshot of a session for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSession {
    pub stream_id: String,
    pub correlation_id: String,
    pub chunks_sent: usize,
    pub status: StreamStatus,
    pub current_phase: Option<PipelinePhase>,
    pub progress: u8,
    pub age_ms: u64,
    pub estimated_remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PhaseProgress {
    phase: Option<PipelinePhase>,
    percent: u8,
}

struct SessionState {
    stream_id: String,
    correlation_id: String,
    started_at: Instant,
    estimated_duration: Duration,
    chunks_sent: AtomicUsize,
    status: Mutex<StreamStatus>,
    progress: Mutex<PhaseProgress>,
}

impl SessionState {
    fn status(&self) -> StreamStatus {
        *self.lock_status()
    }

    fn lock_status(&self) -> MutexGuard<'_, StreamStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_progress(&self) -> MutexGuard<'_, PhaseProgress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move out of `Active`; false when another transition already happened
    fn finish(&self, status: StreamStatus) -> bool {
        let mut current = self.lock_status();
        if *current != StreamStatus::Active {
            return false;
        }
        *current = status;
        true
    }

    fn snapshot(&self) -> StreamSession {
        let progress = *self.lock_progress();
        let age = Instant::now().saturating_duration_since(self.started_at);
        StreamSession {
            stream_id: self.stream_id.clone(),
            correlation_id: self.correlation_id.clone(),
            chunks_sent: self.chunks_sent.load(Ordering::SeqCst),
            status: self.status(),
            current_phase: progress.phase,
            progress: progress.percent,
            age_ms: millis(age),
            estimated_remaining_ms: millis(estimate_remaining(
                self.estimated_duration,
                age,
                progress.percent,
            )),
        }
    }
}

/// Time left, extrapolated from the progress so far once there is any
fn estimate_remaining(estimated: Duration, elapsed: Duration, percent: u8) -> Duration {
    if percent == 0 {
        return estimated.saturating_sub(elapsed);
    }
    let ratio = f64::from(percent.min(100)) / 100.0;
    let total = elapsed.as_secs_f64() / ratio;
    Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

type Registry = Arc<Mutex<HashMap<String, Arc<SessionState>>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, Arc<SessionState>>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn end_session(registry: &Registry, session: &SessionState, status: StreamStatus) -> bool {
    if !session.finish(status) {
        return false;
    }
    let active = {
        let mut sessions = lock_registry(registry);
        sessions.remove(&session.stream_id);
        sessions.len()
    };
    gauge!("suggestion_active_streams", active as f64);
    debug!(
        stream_id = %session.stream_id,
        correlation_id = %session.correlation_id,
        status = ?status,
        chunks = session.chunks_sent.load(Ordering::SeqCst),
        "Stream ended"
    );
    true
}

/// Creates sessions and tracks the active ones
#[derive(Clone)]
pub struct StreamingDelivery {
    config: StreamConfig,
    sessions: Registry,
}

impl StreamingDelivery {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a session; the `Started` event is already queued
    pub fn start(
        &self,
        correlation_id: &str,
        estimated_duration: Duration,
        options: StreamOptions,
    ) -> (StreamHandle, StreamReceiver) {
        let (sender, receiver) = mpsc::channel(self.config.capacity.max(1));
        let session = Arc::new(SessionState {
            stream_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            started_at: Instant::now(),
            estimated_duration,
            chunks_sent: AtomicUsize::new(0),
            status: Mutex::new(StreamStatus::Active),
            progress: Mutex::new(PhaseProgress::default()),
        });

        let active = {
            let mut sessions = lock_registry(&self.sessions);
            sessions.insert(session.stream_id.clone(), Arc::clone(&session));
            sessions.len()
        };
        counter!("suggestion_streams_started_total", 1);
        gauge!("suggestion_active_streams", active as f64);

        // Fresh channel with capacity >= 1, cannot be full
        let _ = sender.try_send(StreamEvent::Started {
            stream_id: session.stream_id.clone(),
            correlation_id: session.correlation_id.clone(),
            estimated_duration_ms: millis(estimated_duration),
            phases: PipelinePhase::ALL.to_vec(),
        });

        let handle = StreamHandle {
            session: Arc::clone(&session),
            sender,
            sessions: Arc::clone(&self.sessions),
            ordering: options.ordering,
        };
        let receiver = StreamReceiver {
            session,
            receiver,
            sessions: Arc::clone(&self.sessions),
            idle_timeout: options.idle_timeout.unwrap_or(self.config.idle_timeout),
            finished: false,
        };
        (handle, receiver)
    }

    /// Sessions that have not reached a terminal state
    pub fn active_sessions(&self) -> Vec<StreamSession> {
        lock_registry(&self.sessions)
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        lock_registry(&self.sessions).len()
    }
}

/// Producer side of a session
pub struct StreamHandle {
    session: Arc<SessionState>,
    sender: mpsc::Sender<StreamEvent>,
    sessions: Registry,
    ordering: OrderingMode,
}

impl StreamHandle {
    pub fn stream_id(&self) -> &str {
        &self.session.stream_id
    }

    pub fn status(&self) -> StreamStatus {
        self.session.status()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == StreamStatus::Cancelled || self.sender.is_closed()
    }

    pub fn chunks_sent(&self) -> usize {
        self.session.chunks_sent.load(Ordering::SeqCst)
    }

    /// Resolves once the receiver is cancelled, dropped or timed out
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    /// Announce that the pipeline entered `phase`.
    ///
    /// Never waits: when the channel is full the consumer already has
    /// unread events and the update is dropped.
    pub fn report_progress(&self, phase: PipelinePhase) {
        if self.session.status() != StreamStatus::Active {
            return;
        }
        let (percent, _) = phase.progress_range();
        *self.session.lock_progress() = PhaseProgress {
            phase: Some(phase),
            percent,
        };
        if self
            .sender
            .try_send(StreamEvent::Progress {
                phase,
                progress: percent,
            })
            .is_err()
        {
            debug!(stream_id = %self.session.stream_id, phase = %phase, "Progress update dropped");
        }
    }

    /// Deliver one suggestion; waits while the channel is full
    pub async fn send_chunk(&self, suggestion: Suggestion) -> Result<(), StreamError> {
        match self.session.status() {
            StreamStatus::Active => {}
            StreamStatus::Cancelled => return Err(StreamError::Cancelled(self.stream_id().to_string())),
            _ => return Err(StreamError::Closed(self.stream_id().to_string())),
        }

        let index = self.session.chunks_sent.load(Ordering::SeqCst);
        if self
            .sender
            .send(StreamEvent::Chunk { index, suggestion })
            .await
            .is_err()
        {
            end_session(&self.sessions, &self.session, StreamStatus::Cancelled);
            return Err(StreamError::Cancelled(self.stream_id().to_string()));
        }
        self.session.chunks_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Deliver a batch in the session's ordering mode
    pub async fn send_batch(&self, mut suggestions: Vec<Suggestion>) -> Result<usize, StreamError> {
        if self.ordering == OrderingMode::Ranked {
            quality::rank(&mut suggestions);
        }
        let count = suggestions.len();
        for suggestion in suggestions {
            self.send_chunk(suggestion).await?;
        }
        Ok(count)
    }

    /// Finish normally
    pub async fn complete(self, meta: ResponseMeta) -> Result<(), StreamError> {
        self.session.lock_progress().percent = 100;
        self.terminate(StreamStatus::Completed, StreamEvent::Completed { meta }).await
    }

    /// Finish with an error
    pub async fn fail(self, reason: impl Into<String>) -> Result<(), StreamError> {
        let reason = reason.into();
        self.terminate(StreamStatus::Errored, StreamEvent::Errored { reason }).await
    }

    /// Stop delivery from the producer side
    pub fn cancel(&self) {
        if end_session(&self.sessions, &self.session, StreamStatus::Cancelled) {
            let _ = self.sender.try_send(StreamEvent::Cancelled);
        }
    }

    async fn terminate(self, status: StreamStatus, event: StreamEvent) -> Result<(), StreamError> {
        match self.session.status() {
            StreamStatus::Active => {}
            StreamStatus::Cancelled => return Err(StreamError::Cancelled(self.stream_id().to_string())),
            _ => return Err(StreamError::Closed(self.stream_id().to_string())),
        }

        if self.sender.send(event).await.is_err() {
            end_session(&self.sessions, &self.session, StreamStatus::Cancelled);
            return Err(StreamError::Cancelled(self.stream_id().to_string()));
        }
        if !end_session(&self.sessions, &self.session, status) {
            // Lost the race against the receiver
            return Err(StreamError::Closed(self.stream_id().to_string()));
        }
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if end_session(&self.sessions, &self.session, StreamStatus::Errored) {
            let _ = self.sender.try_send(StreamEvent::Errored {
                reason: "producer closed the stream before completing it".to_string(),
            });
        }
    }
}

/// Consumer side of a session
pub struct StreamReceiver {
    session: Arc<SessionState>,
    receiver: mpsc::Receiver<StreamEvent>,
    sessions: Registry,
    idle_timeout: Duration,
    finished: bool,
}

impl StreamReceiver {
    pub fn stream_id(&self) -> &str {
        &self.session.stream_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.session.correlation_id
    }

    pub fn status(&self) -> StreamStatus {
        self.session.status()
    }

    /// The next event; `None` after the terminal event.
    ///
    /// Waiting longer than the idle timeout errors the session.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.idle_timeout, self.receiver.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => {
                self.finished = true;
                self.receiver.close();
                let idle = StreamError::IdleTimeout {
                    stream_id: self.stream_id().to_string(),
                    idle_ms: self.idle_timeout.as_millis() as u64,
                };
                end_session(&self.sessions, &self.session, StreamStatus::Errored);
                counter!("suggestion_stream_idle_timeouts_total", 1);
                Some(StreamEvent::Errored {
                    reason: idle.to_string(),
                })
            }
        }
    }

    /// Stop receiving; the producer's next send fails as cancelled
    pub fn cancel(&mut self) {
        self.finished = true;
        self.receiver.close();
        end_session(&self.sessions, &self.session, StreamStatus::Cancelled);
    }

    /// Every remaining event, up to and including the terminal one
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Adapt to a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.next().await.map(|event| (event, receiver))
        })
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        end_session(&self.sessions, &self.session, StreamStatus::Cancelled);
    }
}
