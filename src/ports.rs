//! Typed ports the orchestrator depends on. Concrete adapters (file codecs,
//! HTTP LLM clients, databases) live outside this crate; this module only
//! defines the contracts and, in `#[cfg(test)]`, the fakes this crate's own
//! test suite uses to drive them.

use crate::errors::OrchestratorError;
use crate::model::{
    LogEntry, Phase, ProgressUpdate, RunState, RunSummary, SourceLine, TranslatedLine,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reads an ordered sequence of `SourceLine` from an external source.
#[async_trait]
pub trait IngestAdapter: Send + Sync {
    async fn read(&self, path: &str, format: &str) -> Result<Vec<SourceLine>, OrchestratorError>;
}

/// Summary returned by an export adapter after a successful write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportSummary {
    pub records_exported: usize,
    pub untranslated_records: usize,
}

/// Writes an ordered sequence of `TranslatedLine` to an external sink.
#[async_trait]
pub trait ExportAdapter: Send + Sync {
    async fn write(
        &self,
        path: &str,
        format: &str,
        lines: &[TranslatedLine],
    ) -> Result<ExportSummary, OrchestratorError>;
}

/// Settings controlling one LLM call. Structured-output negotiation and
/// schema retry within a single call are the runtime's responsibility;
/// higher-level ID-alignment retries belong to the Agent Pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    pub model_id: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_s: u64,
    pub retries: u32,
}

/// Runs one prompt against an LLM and returns a schema-validated JSON
/// payload.
#[async_trait]
pub trait LlmRuntime: Send + Sync {
    async fn run_prompt(
        &self,
        prompt: &str,
        schema: &Value,
        settings: &LlmSettings,
    ) -> Result<Value, OrchestratorError>;
}

/// Persists and loads `RunState` snapshots, atomically.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn save_run_state(&self, state: &RunState) -> Result<(), OrchestratorError>;
    async fn load_run_state(&self, run_id: &str) -> Result<Option<RunState>, OrchestratorError>;
    async fn list_runs(&self) -> Result<Vec<RunSummary>, OrchestratorError>;
}

/// Persists and loads phase artifact bodies.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_artifact(
        &self,
        run_id: &str,
        phase: Phase,
        language: Option<&str>,
        revision: u64,
        body: &Value,
    ) -> Result<String, OrchestratorError>;

    async fn load_artifact(&self, artifact_ref: &str) -> Result<Value, OrchestratorError>;

    async fn list_artifacts(
        &self,
        run_id: &str,
    ) -> Result<Vec<crate::model::ArtifactRef>, OrchestratorError>;
}

/// Appends and reads back structured log entries.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: &LogEntry) -> Result<(), OrchestratorError>;
    async fn read(&self, run_id: &str) -> Result<Vec<LogEntry>, OrchestratorError>;
}

/// Accepts `LogEntry` objects. Sink writes are best-effort: an error here is
/// logged internally and never fails the run.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, entry: &LogEntry);
}

/// Accepts `ProgressUpdate` objects, enforcing per-series monotonicity.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, update: &ProgressUpdate) -> Result<(), OrchestratorError>;
}

/// Declarative description of an agent: resolved outside this core (an
/// external loader turns a TOML profile into this descriptor), carrying a
/// runtime-resolved mapping from `output_schema` to a typed parser kept by
/// the `PhaseAgent` implementation itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    pub phase: Phase,
    pub prompt_layers: Vec<String>,
    pub output_schema: String,
    pub tool_allowlist: Vec<String>,
    pub model_hints: Vec<String>,
}

/// A chunk-level milestone a phase agent reports while running. The
/// orchestrator rewrites this into a canonical `ProgressUpdate` (run_id,
/// phase, language, sequence_number) before forwarding it to the configured
/// `ProgressSink`.
#[derive(Debug, Clone)]
pub struct PhaseProgressMilestone {
    pub chunks_completed: usize,
    pub chunks_total: usize,
    /// The phase's natural unit metric (e.g. `lines_translated`) and its
    /// value as of this milestone.
    pub unit_metric_name: String,
    pub unit_metric_value: f64,
}

/// Accepts chunk-level milestones from a running `PhaseAgent`. Implemented
/// by the orchestrator and handed to `PhaseAgent::run` so a concrete agent
/// built on the Agent Pool (`crate::agent_pool`) can forward its
/// `ChunkObserver` callbacks here instead of them going nowhere.
#[async_trait]
pub trait PhaseProgressReporter: Send + Sync {
    async fn report(&self, milestone: PhaseProgressMilestone);
}

/// Returned by a failing `PhaseAgent::run`. Carries whatever output the
/// agent had already produced before the unrecoverable failure (e.g. the
/// Agent Pool's completed chunks, folded into one JSON value by the
/// concrete agent), so the orchestrator can persist it as a diagnostic
/// artifact under the failed revision.
#[derive(Debug)]
pub struct PhaseAgentFailure {
    pub error: OrchestratorError,
    pub partial_output: Option<Value>,
}

impl From<OrchestratorError> for PhaseAgentFailure {
    fn from(error: OrchestratorError) -> Self {
        Self {
            error,
            partial_output: None,
        }
    }
}

/// One phase's agent entry point, as seen by the orchestrator: a typed
/// input payload in, typed output payload out. Concrete phase agents wrap
/// the Agent Pool (`crate::agent_pool`) internally and report chunk
/// progress through `progress` as they go.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    async fn run(
        &self,
        input: Value,
        progress: &dyn PhaseProgressReporter,
    ) -> Result<Value, PhaseAgentFailure>;
}
