use super::*;
use crate::config::RunConfig;
use crate::model::{SourceLine, TranslatedLine};
use crate::ports::ExportSummary;
use crate::sinks::InMemoryProgressSink;
use crate::store::{FileArtifactStore, FileRunStateStore};
use async_trait::async_trait;
use std::sync::Mutex;
use tempfile::tempdir;

struct FakeIngestAdapter {
    lines: Vec<SourceLine>,
}

#[async_trait]
impl IngestAdapter for FakeIngestAdapter {
    async fn read(&self, _path: &str, _format: &str) -> Result<Vec<SourceLine>, OrchestratorError> {
        Ok(self.lines.clone())
    }
}

struct FakeExportAdapter {
    written: Mutex<Vec<(String, Vec<TranslatedLine>)>>,
}

impl FakeExportAdapter {
    fn new() -> Self {
        Self { written: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ExportAdapter for FakeExportAdapter {
    async fn write(&self, path: &str, _format: &str, lines: &[TranslatedLine]) -> Result<ExportSummary, OrchestratorError> {
        self.written.lock().unwrap().push((path.to_string(), lines.to_vec()));
        Ok(ExportSummary {
            records_exported: lines.len(),
            untranslated_records: 0,
        })
    }
}

/// Identity translator: echoes source text as the "translation".
struct IdentityTranslateAgent;

#[async_trait]
impl PhaseAgent for IdentityTranslateAgent {
    async fn run(
        &self,
        input: serde_json::Value,
        _progress: &dyn PhaseProgressReporter,
    ) -> Result<serde_json::Value, PhaseAgentFailure> {
        let source_lines: Vec<SourceLine> = serde_json::from_value(
            input.get("source_lines").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )
        .unwrap();
        let translated: Vec<TranslatedLine> = source_lines
            .iter()
            .map(|s| TranslatedLine::from_source(s, s.text.clone()))
            .collect();
        Ok(serde_json::json!({ "translated_lines": translated }))
    }
}

fn source_line(id: &str, text: &str) -> SourceLine {
    SourceLine {
        line_id: id.to_string(),
        scene_id: None,
        route_id: None,
        speaker: None,
        text: text.to_string(),
        source_columns: Default::default(),
        metadata: Default::default(),
    }
}

async fn build_orchestrator(lines: Vec<SourceLine>) -> (Orchestrator, Arc<FakeExportAdapter>, tempfile::TempDir) {
    let mut phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>> = HashMap::new();
    phase_agents.insert(Phase::Translate, Arc::new(IdentityTranslateAgent));
    let (orchestrator, export_adapter, _artifact_store, dir) =
        build_orchestrator_with_agents(lines, phase_agents).await;
    (orchestrator, export_adapter, dir)
}

async fn build_orchestrator_with_agents(
    lines: Vec<SourceLine>,
    phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
) -> (Orchestrator, Arc<FakeExportAdapter>, Arc<FileArtifactStore>, tempfile::TempDir) {
    let (orchestrator, export_adapter, artifact_store, _progress_sink, dir) =
        build_orchestrator_with_agents_and_progress(lines, phase_agents).await;
    (orchestrator, export_adapter, artifact_store, dir)
}

async fn build_orchestrator_with_agents_and_progress(
    lines: Vec<SourceLine>,
    phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
) -> (
    Orchestrator,
    Arc<FakeExportAdapter>,
    Arc<FileArtifactStore>,
    Arc<InMemoryProgressSink>,
    tempfile::TempDir,
) {
    let dir = tempdir().unwrap();
    let run_state_store = Arc::new(FileRunStateStore::new(dir.path().join("run_state")));
    let artifact_store = Arc::new(FileArtifactStore::new(dir.path().join("artifacts")));
    let export_adapter = Arc::new(FakeExportAdapter::new());
    let progress_sink = Arc::new(InMemoryProgressSink::new());

    let bundle = OrchestratorBundle {
        ingest_adapter: Arc::new(FakeIngestAdapter { lines }),
        export_adapter: export_adapter.clone(),
        phase_agents,
        run_state_store,
        artifact_store: artifact_store.clone(),
        log_sink: Arc::new(crate::sinks::ConsoleLogSink),
        progress_sink: progress_sink.clone(),
    };

    (Orchestrator::new(bundle), export_adapter, artifact_store, progress_sink, dir)
}

fn basic_plan() -> Plan {
    let config = RunConfig::new("en", vec!["fr".to_string()])
        .with_phases_enabled(vec![Phase::Ingest, Phase::Translate, Phase::Export]);
    Plan::new(config, "in.csv", "csv", "out-{language}.csv", "csv")
}

#[tokio::test]
async fn identity_translate_round_trip_completes() {
    let lines = vec![
        source_line("a_1", "one"),
        source_line("a_2", "two"),
        source_line("a_3", "three"),
    ];
    let (orchestrator, export_adapter, _dir) = build_orchestrator(lines).await;

    let state = orchestrator.run(basic_plan(), CancellationToken::new()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let completed: Vec<_> = state.records.iter().filter(|r| r.status == PhaseStatus::Completed).collect();
    assert_eq!(completed.len(), 3, "ingest + translate + export");

    let written = export_adapter.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    let (_, exported_lines) = &written[0];
    assert_eq!(exported_lines.len(), 3);
    assert!(exported_lines.iter().all(|l| l.text == l.source_text));
}

#[tokio::test]
async fn duplicate_line_id_fails_ingest_and_the_run() {
    let lines = vec![source_line("a_1", "one"), source_line("a_1", "dup")];
    let (orchestrator, _export_adapter, _dir) = build_orchestrator(lines).await;

    let state = orchestrator.run(basic_plan(), CancellationToken::new()).await.unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.records.len(), 1, "only the failed ingest record, no downstream attempted");
    let ingest_record = &state.records[0];
    assert_eq!(ingest_record.status, PhaseStatus::Failed);
    assert_eq!(ingest_record.error.as_ref().unwrap().code, "validation_error");
}

#[tokio::test]
async fn zero_source_lines_completes_with_empty_outputs() {
    let (orchestrator, export_adapter, _dir) = build_orchestrator(vec![]).await;
    let state = orchestrator.run(basic_plan(), CancellationToken::new()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let written = export_adapter.written.lock().unwrap();
    assert_eq!(written[0].1.len(), 0);

    let ingest_record = state.records.iter().find(|r| r.phase == Phase::Ingest).unwrap();
    assert_eq!(ingest_record.summary.get("source_lines_count").unwrap(), 0);
}

#[tokio::test]
async fn resume_on_completed_run_produces_no_new_records() {
    let lines = vec![source_line("a_1", "one")];
    let (orchestrator, _export_adapter, _dir) = build_orchestrator(lines).await;

    let plan = basic_plan();
    let first = orchestrator.run(plan.clone(), CancellationToken::new()).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let record_count = first.records.len();

    let second = orchestrator.resume(&first.run_id, plan, CancellationToken::new()).await.unwrap();
    assert_eq!(second.records.len(), record_count, "idempotent resume adds no new records");
}

#[tokio::test]
async fn cancellation_marks_run_cancelled() {
    let lines = vec![source_line("a_1", "one")];
    let (orchestrator, _export_adapter, _dir) = build_orchestrator(lines).await;
    let token = CancellationToken::new();
    token.cancel();

    let state = orchestrator.run(basic_plan(), token).await.unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(state.records.is_empty());
}

/// Cancels `token` the moment it observes a given phase starting, so a test
/// can exercise cancellation that lands strictly between `phase_started`
/// and the phase's actual execution rather than only before `run` is
/// called at all.
struct CancellingProgressSink {
    inner: InMemoryProgressSink,
    token: CancellationToken,
    cancel_on: Phase,
}

#[async_trait]
impl ProgressSink for CancellingProgressSink {
    async fn emit(&self, update: &crate::model::ProgressUpdate) -> Result<(), OrchestratorError> {
        if update.kind == crate::model::ProgressEventKind::PhaseStarted && update.phase == Some(self.cancel_on) {
            self.token.cancel();
        }
        self.inner.emit(update).await
    }
}

#[tokio::test]
async fn cancellation_mid_phase_halts_the_run_without_poisoning_a_language() {
    let lines = vec![source_line("a_1", "one")];
    let mut phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>> = HashMap::new();
    phase_agents.insert(Phase::Translate, Arc::new(IdentityTranslateAgent));

    let dir = tempdir().unwrap();
    let run_state_store = Arc::new(FileRunStateStore::new(dir.path().join("run_state")));
    let artifact_store = Arc::new(FileArtifactStore::new(dir.path().join("artifacts")));
    let export_adapter = Arc::new(FakeExportAdapter::new());
    let token = CancellationToken::new();

    let bundle = OrchestratorBundle {
        ingest_adapter: Arc::new(FakeIngestAdapter { lines }),
        export_adapter: export_adapter.clone(),
        phase_agents,
        run_state_store,
        artifact_store,
        log_sink: Arc::new(crate::sinks::ConsoleLogSink),
        progress_sink: Arc::new(CancellingProgressSink {
            inner: InMemoryProgressSink::new(),
            token: token.clone(),
            cancel_on: Phase::Translate,
        }),
    };
    let orchestrator = Orchestrator::new(bundle);

    let state = orchestrator.run(basic_plan(), token).await.unwrap();

    assert_eq!(state.status, RunStatus::Cancelled);
    let translate_record = state.records.iter().find(|r| r.phase == Phase::Translate).unwrap();
    assert_eq!(translate_record.status, PhaseStatus::Failed);
    assert_eq!(translate_record.error.as_ref().unwrap().code, "cancelled");
    assert!(
        !state.records.iter().any(|r| r.phase == Phase::Export),
        "export never runs once cancellation halts the run"
    );
}

/// Flags any translated line whose text is longer than 3 characters,
/// matching spec.md's scenario 2 fixture.
struct LengthQaAgent;

#[async_trait]
impl PhaseAgent for LengthQaAgent {
    async fn run(
        &self,
        input: serde_json::Value,
        _progress: &dyn PhaseProgressReporter,
    ) -> Result<serde_json::Value, PhaseAgentFailure> {
        let translated_lines: Vec<TranslatedLine> = serde_json::from_value(
            input.get("translated_lines").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )
        .unwrap();

        let mut issues = Vec::new();
        let mut next_id = 1u64;
        for line in &translated_lines {
            if line.text.len() > 3 {
                issues.push(crate::model::QaIssue {
                    issue_id: next_id,
                    line_id: line.line_id.clone(),
                    category: "formatting".to_string(),
                    severity: crate::model::QaSeverity::Minor,
                    message: format!("line exceeds the configured length threshold: \"{}\"", line.text),
                    suggestion: None,
                    metadata: Default::default(),
                });
                next_id += 1;
            }
        }

        Ok(serde_json::json!({
            "checked_lines": translated_lines.iter().map(|l| l.line_id.clone()).collect::<Vec<_>>(),
            "issues": issues,
        }))
    }
}

/// Leaves every translated line unchanged.
struct IdentityEditAgent;

#[async_trait]
impl PhaseAgent for IdentityEditAgent {
    async fn run(
        &self,
        input: serde_json::Value,
        _progress: &dyn PhaseProgressReporter,
    ) -> Result<serde_json::Value, PhaseAgentFailure> {
        let translated_lines: Vec<TranslatedLine> = serde_json::from_value(
            input.get("translated_lines").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )
        .unwrap();
        Ok(serde_json::json!({ "translated_lines": translated_lines }))
    }
}

#[tokio::test]
async fn qa_flags_long_lines_and_identity_edit_leaves_them_unchanged() {
    let lines = vec![
        source_line("a_1", "hi"),
        source_line("a_2", "world"),
        source_line("a_3", "no"),
    ];
    let mut phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>> = HashMap::new();
    phase_agents.insert(Phase::Translate, Arc::new(IdentityTranslateAgent));
    phase_agents.insert(Phase::Qa, Arc::new(LengthQaAgent));
    phase_agents.insert(Phase::Edit, Arc::new(IdentityEditAgent));
    let (orchestrator, export_adapter, artifact_store, _dir) =
        build_orchestrator_with_agents(lines, phase_agents).await;

    let config = RunConfig::new("en", vec!["fr".to_string()]).with_phases_enabled(vec![
        Phase::Ingest,
        Phase::Translate,
        Phase::Qa,
        Phase::Edit,
        Phase::Export,
    ]);
    let plan = Plan::new(config, "in.csv", "csv", "out-{language}.csv", "csv");

    let state = orchestrator.run(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    let qa_record = state.records.iter().find(|r| r.phase == Phase::Qa).unwrap();
    assert_eq!(qa_record.summary.get("issues_total").unwrap(), 1);
    assert_eq!(qa_record.summary.get("lines_checked").unwrap(), 3);

    let qa_artifact = artifact_store
        .load_artifact(qa_record.artifact_refs.first().unwrap())
        .await
        .unwrap();
    let issues: Vec<crate::model::QaIssue> = serde_json::from_value(qa_artifact["issues"].clone()).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].line_id, "a_2");
    assert_eq!(issues[0].severity, crate::model::QaSeverity::Minor);

    let edit_record = state.records.iter().find(|r| r.phase == Phase::Edit).unwrap();
    assert_eq!(edit_record.summary.get("lines_edited").unwrap(), 3);

    let written = export_adapter.written.lock().unwrap();
    assert_eq!(written[0].1.len(), 3);
    assert_eq!(written[0].1.iter().find(|l| l.line_id == "a_2").unwrap().text, "world");
}

/// Fails for a specific target language, succeeding for every other one.
struct LanguageDenylistTranslateAgent {
    deny_language: &'static str,
}

#[async_trait]
impl PhaseAgent for LanguageDenylistTranslateAgent {
    async fn run(
        &self,
        input: serde_json::Value,
        _progress: &dyn PhaseProgressReporter,
    ) -> Result<serde_json::Value, PhaseAgentFailure> {
        let target_language = input.get("target_language").and_then(|v| v.as_str()).unwrap_or("");
        if target_language == self.deny_language {
            return Err(OrchestratorError::orchestration(
                format!("translator unavailable for {}", self.deny_language),
                ErrorContext::phase("translate").with_language(self.deny_language),
            )
            .into());
        }
        let source_lines: Vec<SourceLine> = serde_json::from_value(
            input.get("source_lines").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )
        .unwrap();
        let translated: Vec<TranslatedLine> = source_lines
            .iter()
            .map(|s| TranslatedLine::from_source(s, s.text.clone()))
            .collect();
        Ok(serde_json::json!({ "translated_lines": translated }))
    }
}

#[tokio::test]
async fn one_language_failing_does_not_block_the_others() {
    let lines = vec![source_line("a_1", "one")];
    let mut phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>> = HashMap::new();
    phase_agents.insert(Phase::Translate, Arc::new(LanguageDenylistTranslateAgent { deny_language: "de" }));
    let (orchestrator, export_adapter, _artifact_store, _dir) =
        build_orchestrator_with_agents(lines, phase_agents).await;

    let config = RunConfig::new("en", vec!["fr".to_string(), "de".to_string()])
        .with_phases_enabled(vec![Phase::Ingest, Phase::Translate, Phase::Export]);
    let plan = Plan::new(config, "in.csv", "csv", "out-{language}.csv", "csv");

    let state = orchestrator.run(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(state.status, RunStatus::Failed, "one poisoned language fails the overall run");

    let fr_export = state
        .records
        .iter()
        .find(|r| r.phase == Phase::Export && r.target_language.as_deref() == Some("fr"))
        .unwrap();
    assert_eq!(fr_export.status, PhaseStatus::Completed);

    let de_translate = state
        .records
        .iter()
        .find(|r| r.phase == Phase::Translate && r.target_language.as_deref() == Some("de"))
        .unwrap();
    assert_eq!(de_translate.status, PhaseStatus::Failed);

    assert!(
        !state
            .records
            .iter()
            .any(|r| r.phase == Phase::Export && r.target_language.as_deref() == Some("de")),
        "export is never attempted for the poisoned language"
    );

    let written = export_adapter.written.lock().unwrap();
    assert_eq!(written.len(), 1, "only fr's export actually wrote a file");
}

#[tokio::test]
async fn changing_translate_chunk_size_stales_and_reruns_downstream() {
    let lines = vec![source_line("a_1", "one")];
    let (orchestrator, _export_adapter, _artifact_store, progress_sink, _dir) = {
        let mut phase_agents: HashMap<Phase, Arc<dyn PhaseAgent>> = HashMap::new();
        phase_agents.insert(Phase::Translate, Arc::new(IdentityTranslateAgent));
        build_orchestrator_with_agents_and_progress(lines, phase_agents).await
    };

    let base_config = RunConfig::new("en", vec!["fr".to_string()])
        .with_phases_enabled(vec![Phase::Ingest, Phase::Translate, Phase::Export]);
    let plan = Plan::new(base_config, "in.csv", "csv", "out-{language}.csv", "csv");

    let first = orchestrator.run(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let translate_rev1 = first.records.iter().find(|r| r.phase == Phase::Translate).unwrap();
    assert_eq!(translate_rev1.revision, 1);

    let changed_config = RunConfig::new("en", vec!["fr".to_string()])
        .with_phases_enabled(vec![Phase::Ingest, Phase::Translate, Phase::Export])
        .with_phase_config(Phase::Translate, crate::config::PhaseConfig::default().with_chunk_size(20));
    let changed_plan = Plan::new(changed_config, "in.csv", "csv", "out-{language}.csv", "csv");

    let second = orchestrator
        .resume(&first.run_id, changed_plan, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);

    let stale_translate = second
        .records
        .iter()
        .find(|r| r.phase == Phase::Translate && r.revision == 1)
        .unwrap();
    assert!(stale_translate.stale, "revision 1 remains in history but is marked stale");

    let fresh_translate = second
        .records
        .iter()
        .filter(|r| r.phase == Phase::Translate)
        .max_by_key(|r| r.revision)
        .unwrap();
    assert_eq!(fresh_translate.revision, 2);
    assert!(!fresh_translate.stale);

    let fresh_export = second
        .records
        .iter()
        .filter(|r| r.phase == Phase::Export)
        .max_by_key(|r| r.revision)
        .unwrap();
    assert_eq!(fresh_export.revision, 2, "export reruns once its translate dependency advances");

    let invalidations: Vec<_> = progress_sink
        .updates()
        .into_iter()
        .filter(|u| u.kind == ProgressEventKind::PhaseInvalidated)
        .collect();
    assert!(
        invalidations
            .iter()
            .any(|u| u.phase == Some(Phase::Translate) && u.target_language.as_deref() == Some("fr")),
        "resume emits phase_invalidated for the restaled translate revision"
    );
    assert!(
        invalidations
            .iter()
            .any(|u| u.phase == Some(Phase::Export) && u.target_language.as_deref() == Some("fr")),
        "resume emits phase_invalidated for the downstream export it drags stale too"
    );
}
