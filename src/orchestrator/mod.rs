//! The orchestrator: drives a single run end-to-end.
//!
//! Grounded on the teacher's `dag/executor.rs` (phase-by-phase drive loop,
//! lifecycle events) and `dag/builder.rs` (dependency satisfaction), but
//! specialized to the spec's fixed seven-phase pipeline and its
//! per-language fan-out instead of a user-supplied DAG of arbitrary phases.

pub mod plan;

use crate::config::RunConfig;
use crate::errors::{ErrorContext, OrchestratorError};
use crate::model::{
    DependencyRef, LogEntry, LogLevel, Phase, PhaseRunRecord, PhaseStatus, ProgressEventKind,
    ProgressUpdate, RunState, RunStatus,
};
use crate::ports::{
    ArtifactStore, ExportAdapter, IngestAdapter, LogSink, PhaseAgent, PhaseProgressMilestone,
    PhaseProgressReporter, ProgressSink, RunStateStore,
};
use crate::staleness;
use async_trait::async_trait;
use chrono::Utc;
use plan::{dependencies_of, Plan};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Every external collaborator the orchestrator needs for one run, bundled
/// the way the teacher's `Config`/runtime-handle parameters travel together
/// into `DagExecutor::execute`.
pub struct OrchestratorBundle {
    pub ingest_adapter: Arc<dyn IngestAdapter>,
    pub export_adapter: Arc<dyn ExportAdapter>,
    /// One agent per language-agnostic or language-specific phase that
    /// isn't ingest/export (`context`, `pretranslation`, `translate`,
    /// `qa`, `edit`).
    pub phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
    pub run_state_store: Arc<dyn RunStateStore>,
    pub artifact_store: Arc<dyn ArtifactStore>,
    pub log_sink: Arc<dyn LogSink>,
    pub progress_sink: Arc<dyn ProgressSink>,
}

/// Cooperative cancellation flag, checked at the suspension points named in
/// §5 (LLM call boundary, filesystem write, sink emission). The phase
/// agent/LLM runtime implementations are responsible for checking it at the
/// LLM-call suspension point; the orchestrator checks it between phases and
/// before each persistence write.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    bundle: OrchestratorBundle,
    sequence: AtomicU64,
}

impl Orchestrator {
    pub fn new(bundle: OrchestratorBundle) -> Self {
        Self {
            bundle,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn log(&self, run_id: &str, level: LogLevel, event: &str, phase: Option<Phase>, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            event: event.to_string(),
            run_id: run_id.to_string(),
            phase,
            message: message.into(),
            data: None,
        };
        self.bundle.log_sink.emit(&entry).await;
    }

    async fn emit_progress(
        &self,
        run_id: &str,
        phase: Option<Phase>,
        language: Option<&str>,
        kind: ProgressEventKind,
        percent_complete: Option<f32>,
        metrics: BTreeMap<String, f64>,
    ) -> Result<(), OrchestratorError> {
        let update = ProgressUpdate {
            run_id: run_id.to_string(),
            phase,
            target_language: language.map(|s| s.to_string()),
            kind,
            sequence_number: self.next_sequence(),
            percent_complete,
            metrics,
            eta: None,
            error: None,
        };
        // Best-effort: a sink rejection is logged but must not fail the run.
        if let Err(e) = self.bundle.progress_sink.emit(&update).await {
            self.log(run_id, LogLevel::Warn, "progress_sink_error", phase, e.to_string()).await;
        }
        Ok(())
    }

    /// Emit `phase_invalidated` (progress + log) for every `(phase,
    /// language)` key the staleness engine just newly staled, per §4.3.
    async fn emit_invalidations(&self, run_id: &str, newly_staled: HashSet<staleness::StaleKey>) {
        for key in newly_staled {
            let _ = self
                .emit_progress(
                    run_id,
                    Some(key.phase),
                    key.target_language.as_deref(),
                    ProgressEventKind::PhaseInvalidated,
                    None,
                    BTreeMap::new(),
                )
                .await;
            self.log(
                run_id,
                LogLevel::Warn,
                "phase_invalidated",
                Some(key.phase),
                format!(
                    "revision invalidated by an upstream rerun{}",
                    key.target_language.as_deref().map(|l| format!(" (language {l})")).unwrap_or_default()
                ),
            )
            .await;
        }
    }

    /// Start a fresh run from `plan`.
    pub async fn run(&self, plan: Plan, cancellation: CancellationToken) -> Result<RunState, OrchestratorError> {
        let run_id = Uuid::now_v7().to_string();
        let state = RunState::new(run_id.clone(), Utc::now(), plan.config.fingerprint());
        self.run_with_state(plan, state, cancellation).await
    }

    /// Continue an existing run, re-resolving dependency/staleness state
    /// and re-executing whatever the canonical loop still finds
    /// outstanding. Idempotent resume (§4.1 step 2b) means a fully
    /// completed run simply re-emits `run_started`/`run_completed`.
    pub async fn resume(&self, run_id: &str, plan: Plan, cancellation: CancellationToken) -> Result<RunState, OrchestratorError> {
        let state = self
            .bundle
            .run_state_store
            .load_run_state(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::Orchestration {
                message: format!("no run found with id {run_id}"),
                context: ErrorContext::default(),
            })?;
        self.run_with_state(plan, state, cancellation).await
    }

    async fn run_with_state(&self, plan: Plan, mut state: RunState, cancellation: CancellationToken) -> Result<RunState, OrchestratorError> {
        let run_id = state.run_id.clone();
        state.status = RunStatus::Running;

        self.emit_progress(&run_id, None, None, ProgressEventKind::RunStarted, None, BTreeMap::new()).await?;
        self.log(&run_id, LogLevel::Info, "run_started", None, "run started").await;

        let mut poisoned_languages: HashSet<String> = HashSet::new();
        let mut ingest_failed = false;

        for phase in Phase::CANONICAL_ORDER {
            if !plan.config.is_phase_enabled(phase) {
                continue;
            }
            if cancellation.is_cancelled() {
                return self.finish_cancelled(&plan, &mut state).await;
            }
            if ingest_failed && phase != Phase::Ingest {
                // Ingest failure is fatal to the whole run; nothing downstream runs.
                break;
            }

            let languages: Vec<Option<String>> = if phase.is_language_specific() {
                plan.config.target_languages.iter().cloned().map(Some).collect()
            } else {
                vec![None]
            };

            for language in languages {
                if let Some(lang) = &language {
                    if poisoned_languages.contains(lang) {
                        continue;
                    }
                }
                if cancellation.is_cancelled() {
                    return self.finish_cancelled(&plan, &mut state).await;
                }

                match self
                    .run_one_phase(&plan, &mut state, phase, language.as_deref(), &cancellation)
                    .await
                {
                    Ok(PhaseOutcome::Skipped | PhaseOutcome::Completed) => {}
                    Ok(PhaseOutcome::Blocked) => {
                        if let Some(lang) = &language {
                            poisoned_languages.insert(lang.clone());
                        }
                    }
                    Err(PhaseFailure::Cancelled) => {
                        return self.finish_cancelled(&plan, &mut state).await;
                    }
                    Err(PhaseFailure::Poisoned(failed_language)) => {
                        if phase == Phase::Ingest {
                            ingest_failed = true;
                        } else if let Some(lang) = failed_language.or(language.clone()) {
                            poisoned_languages.insert(lang);
                        }
                    }
                }
            }

            let newly_staled = staleness::recompute(&mut state, &plan.config);
            self.emit_invalidations(&state.run_id, newly_staled).await;
        }

        let any_language_failed = !poisoned_languages.is_empty();
        state.status = if ingest_failed || any_language_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.progress = summarize(&state);

        self.persist_state(&state).await?;

        let kind = if state.status == RunStatus::Completed {
            ProgressEventKind::RunCompleted
        } else {
            ProgressEventKind::RunFailed
        };
        self.emit_progress(&run_id, None, None, kind, None, BTreeMap::new()).await?;
        self.log(
            &run_id,
            if state.status == RunStatus::Completed { LogLevel::Info } else { LogLevel::Error },
            if state.status == RunStatus::Completed { "run_completed" } else { "run_failed" },
            None,
            format!("run finished with status {:?}", state.status),
        )
        .await;

        Ok(state)
    }

    async fn finish_cancelled(&self, _plan: &Plan, state: &mut RunState) -> Result<RunState, OrchestratorError> {
        state.status = RunStatus::Cancelled;
        state.progress = summarize(state);
        self.persist_state(state).await?;
        self.emit_progress(
            &state.run_id,
            None,
            None,
            ProgressEventKind::RunFailed,
            None,
            BTreeMap::new(),
        )
        .await?;
        self.log(&state.run_id, LogLevel::Warn, "run_cancelled", None, "run cancelled").await;
        Ok(state.clone())
    }

    async fn persist_state(&self, state: &RunState) -> Result<(), OrchestratorError> {
        self.bundle.run_state_store.save_run_state(state).await
    }

    /// Execute (or skip, or block) one `(phase, language)` pair. Returns
    /// `Ok(Blocked)` for a dependency gate failure, `Ok(Skipped)` for
    /// idempotent resume, `Ok(Completed)` on success, or `Err(PhaseFailure)`
    /// describing whether the failure poisons one language/the whole run or
    /// is a cancellation that must short-circuit everything.
    async fn run_one_phase(
        &self,
        plan: &Plan,
        state: &mut RunState,
        phase: Phase,
        language: Option<&str>,
        cancellation: &CancellationToken,
    ) -> Result<PhaseOutcome, PhaseFailure> {
        let context = ErrorContext::phase(phase.as_str());
        let context = match language {
            Some(l) => context.with_language(l),
            None => context,
        };

        // 4.1.a: dependency gate.
        let resolved_deps = self.resolve_dependencies(plan, state, phase, language);
        if let Err(missing) = &resolved_deps {
            let record = PhaseRunRecord {
                phase,
                target_language: language.map(|s| s.to_string()),
                revision: state.latest_revision(phase, language) + 1,
                status: PhaseStatus::Blocked,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                dependencies: vec![],
                artifact_refs: vec![],
                summary: crate::model::OpenMap::new(),
                error: Some(
                    OrchestratorError::orchestration(
                        format!("missing hard dependency: {missing}"),
                        context.clone(),
                    )
                    .to_detail(),
                ),
                stale: false,
            };
            state.records.push(record);
            let _ = self
                .emit_progress(
                    &state.run_id,
                    Some(phase),
                    language,
                    ProgressEventKind::PhaseBlocked,
                    None,
                    BTreeMap::new(),
                )
                .await;
            self.log(&state.run_id, LogLevel::Warn, "phase_blocked", Some(phase), format!("blocked: {missing}")).await;
            return Ok(PhaseOutcome::Blocked);
        }
        let dependencies = resolved_deps.unwrap();

        // 4.1.b: idempotent resume.
        if let Some(existing) = state.latest_usable_record(phase, language) {
            let deps_match = existing.dependencies == dependencies;
            let fingerprint_match = existing
                .summary
                .get("config_fingerprint")
                .and_then(|v| v.as_str())
                .map(|fp| fp == plan.config.phase_fingerprint(phase))
                .unwrap_or(false);
            if deps_match && fingerprint_match && !existing.stale {
                return Ok(PhaseOutcome::Skipped);
            }
        }

        let revision = state.latest_revision(phase, language) + 1;
        let _ = self
            .emit_progress(&state.run_id, Some(phase), language, ProgressEventKind::PhaseStarted, Some(0.0), BTreeMap::new())
            .await;
        self.log(&state.run_id, LogLevel::Info, "phase_started", Some(phase), format!("starting revision {revision}")).await;

        if cancellation.is_cancelled() {
            let record = PhaseRunRecord {
                phase,
                target_language: language.map(|s| s.to_string()),
                revision,
                status: PhaseStatus::Failed,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                dependencies,
                artifact_refs: vec![],
                summary: crate::model::OpenMap::new(),
                error: Some(OrchestratorError::cancelled(context.clone()).to_detail()),
                stale: false,
            };
            state.records.push(record);
            let _ = self.persist_state(state).await;
            let _ = self
                .emit_progress(&state.run_id, Some(phase), language, ProgressEventKind::PhaseFailed, None, BTreeMap::new())
                .await;
            self.log(&state.run_id, LogLevel::Warn, "phase_failed", Some(phase), "phase cancelled mid-execution".to_string()).await;
            return Err(PhaseFailure::Cancelled);
        }

        let execution = self.execute_phase(plan, state, phase, language).await;

        match execution {
            Ok((mut summary, artifact_refs)) => {
                summary.insert(
                    "config_fingerprint".to_string(),
                    serde_json::Value::String(plan.config.phase_fingerprint(phase)),
                );
                let record = PhaseRunRecord {
                    phase,
                    target_language: language.map(|s| s.to_string()),
                    revision,
                    status: PhaseStatus::Completed,
                    started_at: Utc::now(),
                    ended_at: Some(Utc::now()),
                    dependencies,
                    artifact_refs,
                    summary,
                    error: None,
                    stale: false,
                };
                state.records.push(record);
                self.persist_state(state)
                    .await
                    .map_err(|_| PhaseFailure::Poisoned(language.map(|s| s.to_string())))?;

                let _ = self
                    .emit_progress(&state.run_id, Some(phase), language, ProgressEventKind::PhaseCompleted, Some(100.0), BTreeMap::new())
                    .await;
                self.log(&state.run_id, LogLevel::Info, "phase_completed", Some(phase), format!("completed revision {revision}")).await;
                Ok(PhaseOutcome::Completed)
            }
            Err(failure) => {
                let record = PhaseRunRecord {
                    phase,
                    target_language: language.map(|s| s.to_string()),
                    revision,
                    status: PhaseStatus::Failed,
                    started_at: Utc::now(),
                    ended_at: Some(Utc::now()),
                    dependencies,
                    artifact_refs: failure.partial_artifact_ref.clone().into_iter().collect(),
                    summary: crate::model::OpenMap::new(),
                    error: Some(failure.error.to_detail()),
                    stale: false,
                };
                state.records.push(record);
                let _ = self.persist_state(state).await;

                let _ = self
                    .emit_progress(&state.run_id, Some(phase), language, ProgressEventKind::PhaseFailed, None, BTreeMap::new())
                    .await;
                self.log(&state.run_id, LogLevel::Error, "phase_failed", Some(phase), failure.error.to_string()).await;
                Err(PhaseFailure::Poisoned(language.map(|s| s.to_string())))
            }
        }
    }

    /// Resolve and validate the hard dependencies for `(phase, language)`.
    /// Returns the recorded `DependencyRef`s (hard and present soft
    /// dependencies) or the name of the first missing/stale hard
    /// dependency.
    fn resolve_dependencies(
        &self,
        plan: &Plan,
        state: &RunState,
        phase: Phase,
        language: Option<&str>,
    ) -> Result<Vec<DependencyRef>, String> {
        let mut edges = dependencies_of(phase);
        if phase == Phase::Export {
            // export hard-depends on edit if edit ran for this language, else on translate.
            let edit_ran = plan.config.is_phase_enabled(Phase::Edit)
                && state.latest_usable_record(Phase::Edit, language).is_some();
            edges.retain(|e| if edit_ran { e.on != Phase::Translate } else { e.on != Phase::Edit });
            for e in edges.iter_mut() {
                if e.on == (if edit_ran { Phase::Edit } else { Phase::Translate }) {
                    e.hard = true;
                }
            }
        }

        let mut resolved = Vec::new();
        for edge in edges {
            let upstream_language = if edge.same_language { language } else { None };
            match state.latest_usable_record(edge.on, upstream_language) {
                Some(record) => resolved.push(DependencyRef {
                    upstream_phase: edge.on,
                    upstream_language: upstream_language.map(|s| s.to_string()),
                    upstream_revision: record.revision,
                }),
                None if edge.hard => return Err(edge.on.as_str().to_string()),
                None => {}
            }
        }
        Ok(resolved)
    }

    /// Dispatch to the ingest adapter, a phase agent, or the export
    /// adapter, and persist the resulting artifact. Returns the phase's
    /// summary metrics and the artifact refs it wrote.
    async fn execute_phase(
        &self,
        plan: &Plan,
        state: &RunState,
        phase: Phase,
        language: Option<&str>,
    ) -> Result<(crate::model::OpenMap, Vec<String>), PhaseExecutionError> {
        let context = ErrorContext::phase(phase.as_str());
        let revision = state.latest_revision(phase, language) + 1;

        match phase {
            Phase::Ingest => {
                let lines = self
                    .bundle
                    .ingest_adapter
                    .read(&plan.input_path, &plan.input_format)
                    .await?;
                validate_unique_line_ids(&lines)?;

                let scene_count = lines.iter().filter_map(|l| l.scene_id.as_ref()).collect::<HashSet<_>>().len();
                let body = serde_json::to_value(&lines)
                    .map_err(|e| OrchestratorError::storage("failed to serialize source lines", e.into()))?;
                let artifact_ref = self
                    .bundle
                    .artifact_store
                    .save_artifact(&state.run_id, phase, None, revision, &body)
                    .await?;

                let mut summary = crate::model::OpenMap::new();
                summary.insert("source_lines_count".into(), lines.len().into());
                summary.insert("scene_count".into(), scene_count.into());
                summary.insert("empty_lines_skipped".into(), 0.into());
                Ok((summary, vec![artifact_ref]))
            }
            Phase::Export => {
                let upstream = if plan.config.is_phase_enabled(Phase::Edit)
                    && state.latest_usable_record(Phase::Edit, language).is_some()
                {
                    Phase::Edit
                } else {
                    Phase::Translate
                };
                let record = state.latest_usable_record(upstream, language).ok_or_else(|| {
                    OrchestratorError::orchestration("export has no translated input to read", context.clone())
                })?;
                let artifact_ref = record
                    .artifact_refs
                    .first()
                    .ok_or_else(|| OrchestratorError::orchestration("upstream phase produced no artifact", context.clone()))?;
                let body = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                let lines: Vec<crate::model::TranslatedLine> =
                    serde_json::from_value(extract_field(&body, "translated_lines"))
                        .map_err(|e| OrchestratorError::storage("failed to parse translated lines", e.into()))?;

                let export_path = plan.export_path(language.unwrap_or(""));
                let export_summary = self
                    .bundle
                    .export_adapter
                    .write(&export_path, &plan.export_format, &lines)
                    .await?;

                let mut summary = crate::model::OpenMap::new();
                summary.insert("records_exported".into(), export_summary.records_exported.into());
                summary.insert("untranslated_records".into(), export_summary.untranslated_records.into());
                Ok((summary, vec![]))
            }
            _ => {
                let agent = self.bundle.phase_agents.get(&phase).ok_or_else(|| {
                    OrchestratorError::config(format!("no phase agent registered for {phase}"))
                })?;
                let input = self.build_phase_input(plan, state, phase, language).await?;
                let reporter = PhaseProgressBridge {
                    orchestrator: self,
                    run_id: state.run_id.clone(),
                    phase,
                    language: language.map(|s| s.to_string()),
                };
                match agent.run(input, &reporter).await {
                    Ok(output) => {
                        let artifact_ref = self
                            .bundle
                            .artifact_store
                            .save_artifact(&state.run_id, phase, language, revision, &output)
                            .await?;
                        let summary = summary_for(phase, &output);
                        Ok((summary, vec![artifact_ref]))
                    }
                    Err(failure) => {
                        let partial_artifact_ref = match failure.partial_output {
                            Some(partial) => self
                                .bundle
                                .artifact_store
                                .save_artifact(&state.run_id, phase, language, revision, &partial)
                                .await
                                .ok(),
                            None => None,
                        };
                        Err(PhaseExecutionError {
                            error: failure.error,
                            partial_artifact_ref,
                        })
                    }
                }
            }
        }
    }

    /// Build the typed input payload for a middle-phase agent: the current
    /// source lines plus whichever upstream artifacts are available,
    /// attaching the target language for language-specific phases.
    async fn build_phase_input(
        &self,
        _plan: &Plan,
        state: &RunState,
        phase: Phase,
        language: Option<&str>,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let mut input = serde_json::Map::new();

        if let Some(ingest) = state.latest_usable_record(Phase::Ingest, None) {
            if let Some(artifact_ref) = ingest.artifact_refs.first() {
                let source_lines = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                input.insert("source_lines".to_string(), source_lines);
            }
        }

        if phase == Phase::Translate {
            if let Some(context_record) = state.latest_usable_record(Phase::Context, None) {
                if let Some(artifact_ref) = context_record.artifact_refs.first() {
                    let body = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                    input.insert("scene_summaries".to_string(), extract_field(&body, "scene_summaries"));
                }
            }
            if let Some(pretranslation_record) = state.latest_usable_record(Phase::Pretranslation, None) {
                if let Some(artifact_ref) = pretranslation_record.artifact_refs.first() {
                    let body = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                    input.insert("annotations".to_string(), extract_field(&body, "annotations"));
                }
            }
        }

        if phase == Phase::Qa || phase == Phase::Edit {
            if let Some(translate_record) = state.latest_usable_record(Phase::Translate, language) {
                if let Some(artifact_ref) = translate_record.artifact_refs.first() {
                    let body = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                    input.insert("translated_lines".to_string(), extract_field(&body, "translated_lines"));
                }
            }
        }
        if phase == Phase::Edit {
            if let Some(qa_record) = state.latest_usable_record(Phase::Qa, language) {
                if let Some(artifact_ref) = qa_record.artifact_refs.first() {
                    let body = self.bundle.artifact_store.load_artifact(artifact_ref).await?;
                    input.insert("qa_issues".to_string(), extract_field(&body, "issues"));
                }
            }
        }

        if let Some(lang) = language {
            input.insert("target_language".to_string(), serde_json::Value::String(lang.to_string()));
        }

        Ok(serde_json::Value::Object(input))
    }
}

enum PhaseOutcome {
    Skipped,
    Completed,
    Blocked,
}

/// Why `run_one_phase` could not complete normally.
enum PhaseFailure {
    /// A plain failure, poisoning the affected language (or, for
    /// language-agnostic phases and `None`, the whole run).
    Poisoned(Option<String>),
    /// Cooperative cancellation took effect mid-phase; the caller must
    /// short-circuit the whole run rather than poison one language.
    Cancelled,
}

/// An `execute_phase` failure. Carries the artifact ref of whatever partial
/// output a phase agent produced before failing (if any), so the caller can
/// record it on the failed `PhaseRunRecord` for diagnostics.
struct PhaseExecutionError {
    error: OrchestratorError,
    partial_artifact_ref: Option<String>,
}

impl From<OrchestratorError> for PhaseExecutionError {
    fn from(error: OrchestratorError) -> Self {
        Self {
            error,
            partial_artifact_ref: None,
        }
    }
}

/// Bridges a `PhaseAgent`'s chunk-level progress reports to the
/// orchestrator's own `ProgressSink`, filling in the `(run_id, phase,
/// language)` envelope the agent itself has no reason to know about.
struct PhaseProgressBridge<'a> {
    orchestrator: &'a Orchestrator,
    run_id: String,
    phase: Phase,
    language: Option<String>,
}

#[async_trait]
impl<'a> PhaseProgressReporter for PhaseProgressBridge<'a> {
    async fn report(&self, milestone: PhaseProgressMilestone) {
        let percent_complete = if milestone.chunks_total > 0 {
            Some((milestone.chunks_completed as f32 / milestone.chunks_total as f32) * 100.0)
        } else {
            None
        };
        let mut metrics = BTreeMap::new();
        metrics.insert("chunks_completed".to_string(), milestone.chunks_completed as f64);
        metrics.insert("chunks_total".to_string(), milestone.chunks_total as f64);
        metrics.insert(milestone.unit_metric_name, milestone.unit_metric_value);
        let _ = self
            .orchestrator
            .emit_progress(
                &self.run_id,
                Some(self.phase),
                self.language.as_deref(),
                ProgressEventKind::PhaseProgress,
                percent_complete,
                metrics,
            )
            .await;
    }
}

/// Phase agents report their typed output nested under a named field (e.g.
/// `{"translated_lines": [...]}`), matching `summary_for`'s own field
/// lookups. Pull that field back out when forwarding an upstream artifact
/// into a downstream phase's input or the export adapter, rather than
/// re-nesting the whole wrapper object under the same key. Adapters that
/// already hand back a bare array (as `ingest` does) pass through
/// unchanged.
fn extract_field(body: &serde_json::Value, field: &str) -> serde_json::Value {
    match body {
        serde_json::Value::Object(map) => map.get(field).cloned().unwrap_or(serde_json::Value::Array(vec![])),
        other => other.clone(),
    }
}

fn validate_unique_line_ids(lines: &[crate::model::SourceLine]) -> Result<(), OrchestratorError> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut duplicates = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(&first) = seen.get(line.line_id.as_str()) {
            duplicates.push((first, i, line.line_id.clone()));
        } else {
            seen.insert(&line.line_id, i);
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        let detail = duplicates
            .iter()
            .map(|(a, b, id)| format!("{id} at lines {a} and {b}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(OrchestratorError::validation(
            format!("duplicate line_id(s): {detail}"),
            ErrorContext::phase(Phase::Ingest.as_str()),
        ))
    }
}

fn summary_for(phase: Phase, output: &serde_json::Value) -> crate::model::OpenMap {
    let mut summary = crate::model::OpenMap::new();
    let array_len = |key: &str| -> usize {
        output.get(key).and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0)
    };
    match phase {
        Phase::Context => {
            summary.insert("scenes_summarized".into(), array_len("scene_summaries").into());
            let characters: HashSet<&str> = output
                .get("scene_summaries")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|scene| scene.get("characters").and_then(|c| c.as_array()))
                .flatten()
                .filter_map(|c| c.as_str())
                .collect();
            summary.insert("characters_identified".into(), characters.len().into());
        }
        Phase::Pretranslation => {
            summary.insert("lines_annotated".into(), array_len("annotations").into());
            summary.insert("annotations_total".into(), array_len("annotations").into());
        }
        Phase::Translate => {
            summary.insert("lines_translated".into(), array_len("translated_lines").into());
            summary.insert("retried_chunks".into(), 0.into());
        }
        Phase::Qa => {
            summary.insert("lines_checked".into(), array_len("checked_lines").into());
            summary.insert("issues_total".into(), array_len("issues").into());
            let mut minor = 0usize;
            let mut major = 0usize;
            let mut critical = 0usize;
            for issue in output.get("issues").and_then(|v| v.as_array()).into_iter().flatten() {
                match issue.get("severity").and_then(|v| v.as_str()) {
                    Some("minor") => minor += 1,
                    Some("major") => major += 1,
                    Some("critical") => critical += 1,
                    _ => {}
                }
            }
            summary.insert("issues_minor".into(), minor.into());
            summary.insert("issues_major".into(), major.into());
            summary.insert("issues_critical".into(), critical.into());
        }
        Phase::Edit => {
            summary.insert("lines_edited".into(), array_len("translated_lines").into());
            summary.insert("issues_resolved".into(), 0.into());
        }
        Phase::Ingest | Phase::Export => {}
    }
    summary
}

fn summarize(state: &RunState) -> crate::model::ProgressSummary {
    let mut completed = 0;
    let mut failed = 0;
    let mut blocked = 0;
    for record in &state.records {
        match record.status {
            PhaseStatus::Completed => completed += 1,
            PhaseStatus::Failed => failed += 1,
            PhaseStatus::Blocked => blocked += 1,
            PhaseStatus::Stale => {}
        }
    }
    crate::model::ProgressSummary {
        phases_total: state.records.len(),
        phases_completed: completed,
        phases_failed: failed,
        phases_blocked: blocked,
    }
}

#[cfg(test)]
mod tests;
