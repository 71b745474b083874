//! The shared data model: entities and identifiers common to every phase.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+(?:_[0-9]+)+$").expect("static regex is valid"));

/// Validate that `id` matches the canonical `line_id`/`scene_id` shape:
/// `^[a-z]+(?:_[0-9]+)+$`. Adapters are responsible for normalizing human
/// input to this shape before it reaches the orchestrator.
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

/// An open, pass-through JSON map. Used only for fields whose semantics are
/// explicitly "carry this through unmodified" (`metadata`, `source_columns`,
/// log `data`).
pub type OpenMap = BTreeMap<String, serde_json::Value>;

/// One atomic unit of text to translate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceLine {
    pub line_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
    #[serde(default)]
    pub source_columns: OpenMap,
    #[serde(default)]
    pub metadata: OpenMap,
}

/// One translated unit. Inherits `SourceLine` identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslatedLine {
    pub line_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub source_text: String,
    pub text: String,
    #[serde(default)]
    pub source_columns: OpenMap,
    #[serde(default)]
    pub metadata: OpenMap,
}

impl TranslatedLine {
    pub fn from_source(source: &SourceLine, translated_text: impl Into<String>) -> Self {
        Self {
            line_id: source.line_id.clone(),
            scene_id: source.scene_id.clone(),
            route_id: source.route_id.clone(),
            speaker: source.speaker.clone(),
            source_text: source.text.clone(),
            text: translated_text.into(),
            source_columns: source.source_columns.clone(),
            metadata: source.metadata.clone(),
        }
    }
}

/// Per-scene context produced by the `context` phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneSummary {
    pub scene_id: String,
    pub summary: String,
    #[serde(default)]
    pub characters: Vec<String>,
}

/// A pretranslation category applied to a line of dialogue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationCategory {
    Idiom,
    Cultural,
    Wordplay,
    Other,
}

/// Per-line pretranslation note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub line_id: String,
    pub category: AnnotationCategory,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Severity of a QA finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QaSeverity {
    Minor,
    Major,
    Critical,
}

/// One QA finding against a translated line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaIssue {
    /// Monotonic unique identifier within the phase run.
    pub issue_id: u64,
    pub line_id: String,
    pub category: String,
    pub severity: QaSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub metadata: OpenMap,
}

/// The canonical phase order. Language-specific phases are `Translate`,
/// `Qa`, `Edit`, `Export`; they fan out once per configured target
/// language. `Context` and `Pretranslation` are language-agnostic. `Ingest`
/// runs once per run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingest,
    Context,
    Pretranslation,
    Translate,
    Qa,
    Edit,
    Export,
}

impl Phase {
    /// The fixed pipeline order, used for planning and staleness traversal.
    pub const CANONICAL_ORDER: [Phase; 7] = [
        Phase::Ingest,
        Phase::Context,
        Phase::Pretranslation,
        Phase::Translate,
        Phase::Qa,
        Phase::Edit,
        Phase::Export,
    ];

    pub fn is_language_specific(self) -> bool {
        matches!(self, Phase::Translate | Phase::Qa | Phase::Edit | Phase::Export)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ingest => "ingest",
            Phase::Context => "context",
            Phase::Pretranslation => "pretranslation",
            Phase::Translate => "translate",
            Phase::Qa => "qa",
            Phase::Edit => "edit",
            Phase::Export => "export",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one phase execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Blocked,
    Stale,
}

/// A recorded reference from a `PhaseRunRecord` to an upstream
/// `(phase, language, revision)` whose output it consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyRef {
    pub upstream_phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_language: Option<String>,
    pub upstream_revision: u64,
}

/// Immutable record of one phase execution. A `Completed` record is never
/// mutated; it may later be marked `stale` by a subsequent upstream rerun,
/// but its recorded content (dependencies, summary, artifacts) is intact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRunRecord {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    /// Monotonic per (phase, language) within the run.
    pub revision: u64,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<DependencyRef>,
    pub artifact_refs: Vec<String>,
    #[serde(default)]
    pub summary: OpenMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::errors::ErrorDetail>,
    /// Set once a later upstream revision invalidates this record. The
    /// record's content is never rewritten; only this flag flips.
    #[serde(default)]
    pub stale: bool,
}

impl PhaseRunRecord {
    /// The `(phase, language)` key this record belongs to.
    pub fn key(&self) -> (Phase, Option<String>) {
        (self.phase, self.target_language.clone())
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Coarse progress summary carried on a `RunState` snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSummary {
    pub phases_total: usize,
    pub phases_completed: usize,
    pub phases_failed: usize,
    pub phases_blocked: usize,
}

/// The on-disk/in-memory run snapshot. Schema-versioned for forward
/// compatibility of the persisted JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub config_fingerprint: String,
    /// Every recorded execution, in the order appended. Use
    /// [`RunState::latest_record`] to find the current revision of a
    /// `(phase, language)` pair.
    pub records: Vec<PhaseRunRecord>,
    pub status: RunStatus,
    pub progress: ProgressSummary,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl RunState {
    pub fn new(run_id: impl Into<String>, created_at: DateTime<Utc>, config_fingerprint: impl Into<String>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at,
            config_fingerprint: config_fingerprint.into(),
            records: Vec::new(),
            status: RunStatus::Running,
            progress: ProgressSummary::default(),
        }
    }

    /// The most recent record (by append order) for a `(phase, language)`
    /// pair, regardless of its status.
    pub fn latest_record(&self, phase: Phase, language: Option<&str>) -> Option<&PhaseRunRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.phase == phase && r.target_language.as_deref() == language)
    }

    /// The highest revision recorded for a `(phase, language)` pair, 0 if
    /// none.
    pub fn latest_revision(&self, phase: Phase, language: Option<&str>) -> u64 {
        self.records
            .iter()
            .filter(|r| r.phase == phase && r.target_language.as_deref() == language)
            .map(|r| r.revision)
            .max()
            .unwrap_or(0)
    }

    /// The latest completed, non-stale record for a `(phase, language)`
    /// pair, i.e. the one downstream phases should read from.
    pub fn latest_usable_record(&self, phase: Phase, language: Option<&str>) -> Option<&PhaseRunRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| {
                r.phase == phase
                    && r.target_language.as_deref() == language
                    && r.status == PhaseStatus::Completed
                    && !r.stale
            })
    }
}

/// A persisted phase output body, referenced by a stable id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub artifact_ref: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub revision: u64,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Json,
    Jsonl,
}

/// Kind of one progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    PhaseStarted,
    PhaseProgress,
    PhaseCompleted,
    PhaseFailed,
    PhaseBlocked,
    PhaseInvalidated,
}

/// One progress event. `sequence_number` strictly increases and
/// `percent_complete` is non-decreasing within a single `(run, phase,
/// language)` series, except across an explicit invalidation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdate {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    pub kind: ProgressEventKind,
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f32>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::errors::ErrorDetail>,
}

/// Structured log level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log line. Exactly one JSON object per line; no
/// multi-line entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// snake_case event name.
    pub event: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OpenMap>,
}

/// A fast, separate index entry for `list_runs`, kept deliberately smaller
/// than a full `RunState` so listing runs stays O(1) per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub phases_completed: usize,
}

impl crate::agent_pool::Identified for SourceLine {
    fn item_id(&self) -> &str {
        &self.line_id
    }
}

impl crate::agent_pool::Identified for TranslatedLine {
    fn item_id(&self) -> &str {
        &self.line_id
    }
}

impl crate::agent_pool::Identified for SceneSummary {
    fn item_id(&self) -> &str {
        &self.scene_id
    }
}

impl crate::agent_pool::Identified for Annotation {
    fn item_id(&self) -> &str {
        &self.line_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(is_valid_id("scene_1"));
        assert!(is_valid_id("a_1_2"));
        assert!(is_valid_id("line_001"));
        assert!(!is_valid_id("Scene_1"));
        assert!(!is_valid_id("scene"));
        assert!(!is_valid_id("scene_"));
        assert!(!is_valid_id("1_scene"));
        assert!(!is_valid_id(""));
    }

    #[test]
    fn translated_line_preserves_identity() {
        let source = SourceLine {
            line_id: "a_1".into(),
            scene_id: Some("scene_1".into()),
            route_id: None,
            speaker: Some("hero".into()),
            text: "one".into(),
            source_columns: OpenMap::new(),
            metadata: OpenMap::new(),
        };
        let translated = TranslatedLine::from_source(&source, "uno");
        assert_eq!(translated.line_id, "a_1");
        assert_eq!(translated.source_text, "one");
        assert_eq!(translated.text, "uno");
    }

    #[test]
    fn run_state_tracks_latest_revision() {
        let mut state = RunState::new("run_1", Utc::now(), "fp");
        assert_eq!(state.latest_revision(Phase::Translate, Some("fr")), 0);

        state.records.push(PhaseRunRecord {
            phase: Phase::Translate,
            target_language: Some("fr".into()),
            revision: 1,
            status: PhaseStatus::Completed,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            dependencies: vec![],
            artifact_refs: vec![],
            summary: OpenMap::new(),
            error: None,
            stale: false,
        });

        assert_eq!(state.latest_revision(Phase::Translate, Some("fr")), 1);
        assert!(state.latest_usable_record(Phase::Translate, Some("fr")).is_some());
    }

    #[test]
    fn stale_record_is_not_usable() {
        let mut state = RunState::new("run_1", Utc::now(), "fp");
        state.records.push(PhaseRunRecord {
            phase: Phase::Context,
            target_language: None,
            revision: 1,
            status: PhaseStatus::Completed,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            dependencies: vec![],
            artifact_refs: vec![],
            summary: OpenMap::new(),
            error: None,
            stale: true,
        });
        assert!(state.latest_usable_record(Phase::Context, None).is_none());
        assert!(state.latest_record(Phase::Context, None).is_some());
    }
}
