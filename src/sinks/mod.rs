//! Log and progress sinks: transport structured events out of the
//! orchestrator without blocking it for long.

use crate::errors::OrchestratorError;
use crate::model::{LogEntry, ProgressUpdate};
use crate::ports::{LogSink, ProgressSink};
use crate::redact::redact;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

/// Writes one JSON object per line to a per-run log file. Sink writes are
/// best-effort: an I/O error here is recorded via `tracing` and swallowed,
/// matching §4.5's "a sink error is logged internally but does not fail the
/// run".
pub struct JsonlLogSink {
    path: PathBuf,
    file: AsyncMutex<Option<fs::File>>,
}

impl JsonlLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: AsyncMutex::new(None),
        }
    }

    async fn ensure_open(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for JsonlLogSink {
    async fn emit(&self, entry: &LogEntry) {
        if let Err(e) = self.ensure_open().await {
            tracing::warn!(error = %e, "failed to open log sink file");
            return;
        }
        let Ok(mut line) = serde_json::to_vec(entry) else {
            tracing::warn!("failed to serialize log entry");
            return;
        };
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(&line).await {
                tracing::warn!(error = %e, "failed to write log entry");
            }
        }
    }
}

/// Writes entries to stdout via `tracing`, matching the teacher's console
/// logging style.
pub struct ConsoleLogSink;

#[async_trait]
impl LogSink for ConsoleLogSink {
    async fn emit(&self, entry: &LogEntry) {
        match entry.level {
            crate::model::LogLevel::Debug => tracing::debug!(event = %entry.event, run_id = %entry.run_id, "{}", entry.message),
            crate::model::LogLevel::Info => tracing::info!(event = %entry.event, run_id = %entry.run_id, "{}", entry.message),
            crate::model::LogLevel::Warn => tracing::warn!(event = %entry.event, run_id = %entry.run_id, "{}", entry.message),
            crate::model::LogLevel::Error => tracing::error!(event = %entry.event, run_id = %entry.run_id, "{}", entry.message),
        }
    }
}

/// Fans a single `LogEntry` out to multiple sinks.
pub struct CompositeLogSink {
    sinks: Vec<Box<dyn LogSink>>,
}

impl CompositeLogSink {
    pub fn new(sinks: Vec<Box<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSink for CompositeLogSink {
    async fn emit(&self, entry: &LogEntry) {
        for sink in &self.sinks {
            sink.emit(entry).await;
        }
    }
}

/// Scrubs known secret patterns from `message` and `data` before passing
/// the entry to the wrapped sink.
pub struct RedactingLogSink<S> {
    inner: S,
}

impl<S> RedactingLogSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: LogSink> LogSink for RedactingLogSink<S> {
    async fn emit(&self, entry: &LogEntry) {
        let mut redacted = entry.clone();
        redacted.message = redact(&entry.message);
        if let Some(data) = &entry.data {
            let scrubbed = crate::redact::redact_json(&serde_json::to_value(data).unwrap_or_default());
            redacted.data = serde_json::from_value(scrubbed).ok();
        }
        self.inner.emit(&redacted).await;
    }
}

/// Tracks the last `sequence_number` seen per `(run_id, phase, language)`
/// series and rejects out-of-order updates, per §4.5's monotonicity
/// guarantee.
struct SeriesTracker {
    last_sequence: HashMap<(String, Option<String>, Option<String>), u64>,
}

impl SeriesTracker {
    fn new() -> Self {
        Self {
            last_sequence: HashMap::new(),
        }
    }

    fn check_and_record(&mut self, update: &ProgressUpdate) -> Result<(), OrchestratorError> {
        let key = (
            update.run_id.clone(),
            update.phase.map(|p| p.as_str().to_string()),
            update.target_language.clone(),
        );
        if let Some(&last) = self.last_sequence.get(&key) {
            if update.sequence_number <= last {
                return Err(OrchestratorError::Orchestration {
                    message: format!(
                        "out-of-order progress update: sequence_number {} did not increase past {}",
                        update.sequence_number, last
                    ),
                    context: crate::errors::ErrorContext::default(),
                });
            }
        }
        self.last_sequence.insert(key, update.sequence_number);
        Ok(())
    }
}

/// An in-memory progress sink, for tests and embedders that want to poll
/// progress directly instead of tailing a file.
pub struct InMemoryProgressSink {
    updates: Mutex<Vec<ProgressUpdate>>,
    tracker: Mutex<SeriesTracker>,
}

impl InMemoryProgressSink {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            tracker: Mutex::new(SeriesTracker::new()),
        }
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl Default for InMemoryProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressSink for InMemoryProgressSink {
    async fn emit(&self, update: &ProgressUpdate) -> Result<(), OrchestratorError> {
        self.tracker.lock().unwrap().check_and_record(update)?;
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a per-run progress file.
pub struct FileProgressSink {
    path: PathBuf,
    file: AsyncMutex<Option<fs::File>>,
    tracker: Mutex<SeriesTracker>,
}

impl FileProgressSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: AsyncMutex::new(None),
            tracker: Mutex::new(SeriesTracker::new()),
        }
    }

    async fn ensure_open(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for FileProgressSink {
    async fn emit(&self, update: &ProgressUpdate) -> Result<(), OrchestratorError> {
        self.tracker.lock().unwrap().check_and_record(update)?;

        self.ensure_open()
            .await
            .map_err(|e| OrchestratorError::storage("failed to open progress sink file", e.into()))?;
        let mut line = serde_json::to_vec(update)
            .map_err(|e| OrchestratorError::storage("failed to serialize progress update", e.into()))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.write_all(&line)
                .await
                .map_err(|e| OrchestratorError::storage("failed to write progress update", e.into()))?;
        }
        Ok(())
    }
}
