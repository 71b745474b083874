//! Filesystem-backed `RunStateStore` and `ArtifactStore` implementations.
//!
//! Grounded on the teacher's `audit/logger.rs` snapshot-persistence shape
//! (`current-run.json` / `runs/<id>.json`), upgraded to genuinely atomic
//! write-then-rename semantics (the teacher's `save_current` overwrites the
//! file directly; §4.4 requires no partial writes ever be visible). See
//! DESIGN.md for that gap and the fix applied here.

use crate::errors::OrchestratorError;
use crate::model::{ArtifactFormat, ArtifactRef, Phase, RunState, RunSummary};
use crate::ports::{ArtifactStore, RunStateStore};
use crate::redact::redact_json;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

fn run_state_dir(root: &Path) -> PathBuf {
    root.join("run_state").join("runs")
}

fn index_dir(root: &Path) -> PathBuf {
    root.join("run_state").join("index")
}

fn artifacts_dir(root: &Path, run_id: &str) -> PathBuf {
    root.join("artifacts").join(run_id)
}

/// Write `body` to `path` by writing to a sibling temp file and renaming it
/// into place, so readers never observe a partially-written file.
async fn atomic_write(path: &Path, body: &[u8]) -> Result<(), OrchestratorError> {
    let parent = path.parent().ok_or_else(|| {
        OrchestratorError::storage("path has no parent directory", anyhow::anyhow!("{:?}", path))
    })?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| OrchestratorError::storage("failed to create storage directory", e.into()))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("artifact"),
        uuid::Uuid::now_v7()
    ));

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| OrchestratorError::storage("failed to create temp file", e.into()))?;
    file.write_all(body)
        .await
        .map_err(|e| OrchestratorError::storage("failed to write temp file", e.into()))?;
    file.sync_all()
        .await
        .map_err(|e| OrchestratorError::storage("failed to flush temp file", e.into()))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| OrchestratorError::storage("failed to rename temp file into place", e.into()))?;
    Ok(())
}

/// Persists `RunState` snapshots under `<root>/run_state/{runs,index}`.
pub struct FileRunStateStore {
    root: PathBuf,
}

impl FileRunStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RunStateStore for FileRunStateStore {
    async fn save_run_state(&self, state: &RunState) -> Result<(), OrchestratorError> {
        let snapshot_path = run_state_dir(&self.root).join(format!("{}.json", state.run_id));
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| OrchestratorError::storage("failed to serialize run state", e.into()))?;
        atomic_write(&snapshot_path, &body).await?;

        let summary = RunSummary {
            run_id: state.run_id.clone(),
            created_at: state.created_at,
            status: state.status,
            phases_completed: state.progress.phases_completed,
        };
        let index_path = index_dir(&self.root).join(format!("{}.json", state.run_id));
        let index_body = serde_json::to_vec(&summary)
            .map_err(|e| OrchestratorError::storage("failed to serialize run summary", e.into()))?;
        atomic_write(&index_path, &index_body).await?;

        Ok(())
    }

    async fn load_run_state(&self, run_id: &str) -> Result<Option<RunState>, OrchestratorError> {
        let path = run_state_dir(&self.root).join(format!("{run_id}.json"));
        match fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .map_err(|e| OrchestratorError::storage("failed to parse run state snapshot", e.into()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::storage("failed to read run state snapshot", e.into())),
        }
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, OrchestratorError> {
        let dir = index_dir(&self.root);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::storage("failed to list run index", e.into())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::storage("failed to read run index entry", e.into()))?
        {
            let bytes = fs::read(entry.path())
                .await
                .map_err(|e| OrchestratorError::storage("failed to read run summary", e.into()))?;
            let summary: RunSummary = serde_json::from_slice(&bytes)
                .map_err(|e| OrchestratorError::storage("failed to parse run summary", e.into()))?;
            summaries.push(summary);
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

/// Persists phase artifact bodies under `<root>/artifacts/<run_id>`.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_index(&self, run_id: &str) -> Result<Vec<ArtifactRef>, OrchestratorError> {
        let path = artifacts_dir(&self.root, run_id).join("index.jsonl");
        match fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|line| {
                    serde_json::from_str(line)
                        .map_err(|e| OrchestratorError::storage("failed to parse artifact index line", e.into()))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(OrchestratorError::storage("failed to read artifact index", e.into())),
        }
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn save_artifact(
        &self,
        run_id: &str,
        phase: Phase,
        language: Option<&str>,
        revision: u64,
        body: &Value,
    ) -> Result<String, OrchestratorError> {
        let mut index = self.read_index(run_id).await?;

        if index
            .iter()
            .any(|a| a.phase == phase && a.language.as_deref() == language && a.revision == revision)
        {
            return Err(OrchestratorError::Orchestration {
                message: format!(
                    "artifact already exists for ({phase}, {language:?}, revision {revision}); artifacts are immutable"
                ),
                context: crate::errors::ErrorContext::phase(phase.as_str()),
            });
        }

        let seq = index.len();
        let format = if body.is_array() { ArtifactFormat::Jsonl } else { ArtifactFormat::Json };
        let ext = match format {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Jsonl => "jsonl",
        };
        let artifact_ref = format!("{run_id}/artifact-{seq}");
        let path = artifacts_dir(&self.root, run_id).join(format!("artifact-{seq}.{ext}"));

        let bytes = match (format, body) {
            (ArtifactFormat::Jsonl, Value::Array(items)) => {
                let mut buf = Vec::new();
                for item in items {
                    serde_json::to_writer(&mut buf, item)
                        .map_err(|e| OrchestratorError::storage("failed to serialize artifact line", e.into()))?;
                    buf.push(b'\n');
                }
                buf
            }
            _ => serde_json::to_vec(body)
                .map_err(|e| OrchestratorError::storage("failed to serialize artifact", e.into()))?,
        };

        atomic_write(&path, &bytes).await?;

        let entry = ArtifactRef {
            artifact_ref: artifact_ref.clone(),
            phase,
            language: language.map(|s| s.to_string()),
            revision,
            format,
            size_bytes: bytes.len() as u64,
            created_at: chrono::Utc::now(),
        };
        index.push(entry.clone());

        let mut index_body = Vec::new();
        for entry in &index {
            serde_json::to_writer(&mut index_body, entry)
                .map_err(|e| OrchestratorError::storage("failed to serialize artifact index", e.into()))?;
            index_body.push(b'\n');
        }
        let index_path = artifacts_dir(&self.root, run_id).join("index.jsonl");
        atomic_write(&index_path, &index_body).await?;

        Ok(artifact_ref)
    }

    async fn load_artifact(&self, artifact_ref: &str) -> Result<Value, OrchestratorError> {
        let (run_id, name) = artifact_ref.split_once('/').ok_or_else(|| {
            OrchestratorError::Validation {
                message: format!("malformed artifact_ref: {artifact_ref}"),
                context: crate::errors::ErrorContext::default(),
            }
        })?;
        let index = self.read_index(run_id).await?;
        let entry = index
            .iter()
            .find(|a| a.artifact_ref == artifact_ref)
            .ok_or_else(|| OrchestratorError::Validation {
                message: format!("unknown artifact_ref: {artifact_ref}"),
                context: crate::errors::ErrorContext::default(),
            })?;
        let ext = match entry.format {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Jsonl => "jsonl",
        };
        let path = artifacts_dir(&self.root, run_id).join(format!("{name}.{ext}"));
        let contents = fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::storage("failed to read artifact body", e.into()))?;

        match entry.format {
            ArtifactFormat::Json => serde_json::from_str(&contents)
                .map_err(|e| OrchestratorError::storage("failed to parse artifact body", e.into())),
            ArtifactFormat::Jsonl => {
                let items: Result<Vec<Value>, _> = contents
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(serde_json::from_str)
                    .collect();
                let items = items.map_err(|e| OrchestratorError::storage("failed to parse artifact line", e.into()))?;
                Ok(Value::Array(items))
            }
        }
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRef>, OrchestratorError> {
        self.read_index(run_id).await
    }
}

/// Wraps an [`ArtifactStore`] so every saved body has known secret patterns
/// scrubbed before it touches disk, per §4.4's "no secrets appear in
/// artifacts" invariant.
pub struct RedactingArtifactStore<S> {
    inner: S,
}

impl<S> RedactingArtifactStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: ArtifactStore> ArtifactStore for RedactingArtifactStore<S> {
    async fn save_artifact(
        &self,
        run_id: &str,
        phase: Phase,
        language: Option<&str>,
        revision: u64,
        body: &Value,
    ) -> Result<String, OrchestratorError> {
        let redacted = redact_json(body);
        self.inner.save_artifact(run_id, phase, language, revision, &redacted).await
    }

    async fn load_artifact(&self, artifact_ref: &str) -> Result<Value, OrchestratorError> {
        self.inner.load_artifact(artifact_ref).await
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRef>, OrchestratorError> {
        self.inner.list_artifacts(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::model::RunState;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_and_load_run_state_round_trips() {
        let dir = tempdir().unwrap();
        let store = FileRunStateStore::new(dir.path());
        let config = RunConfig::new("en", vec!["fr".into()]);
        let state = RunState::new("run_1", chrono::Utc::now(), config.fingerprint());

        store.save_run_state(&state).await.unwrap();
        let loaded = store.load_run_state("run_1").await.unwrap().unwrap();
        assert_eq!(loaded.run_id, state.run_id);

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "run_1");
    }

    #[tokio::test]
    async fn load_missing_run_state_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileRunStateStore::new(dir.path());
        assert!(store.load_run_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn artifact_save_load_round_trip_json() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let body = json!({"lines": [{"line_id": "a_1", "text": "one"}]});
        let artifact_ref = store
            .save_artifact("run_1", Phase::Translate, Some("fr"), 1, &body)
            .await
            .unwrap();

        let loaded = store.load_artifact(&artifact_ref).await.unwrap();
        assert_eq!(loaded, body);
    }

    #[tokio::test]
    async fn artifact_save_rejects_overwrite_of_same_revision() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let body = json!({"a": 1});
        store
            .save_artifact("run_1", Phase::Translate, Some("fr"), 1, &body)
            .await
            .unwrap();
        let result = store
            .save_artifact("run_1", Phase::Translate, Some("fr"), 1, &body)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn jsonl_artifact_round_trips_as_array() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let body = json!([{"line_id": "a_1"}, {"line_id": "a_2"}]);
        let artifact_ref = store
            .save_artifact("run_1", Phase::Qa, Some("fr"), 1, &body)
            .await
            .unwrap();
        let loaded = store.load_artifact(&artifact_ref).await.unwrap();
        assert_eq!(loaded, body);

        let index = store.list_artifacts("run_1").await.unwrap();
        assert_eq!(index[0].format, ArtifactFormat::Jsonl);
    }

    #[tokio::test]
    async fn redacting_store_scrubs_secrets_before_write() {
        let dir = tempdir().unwrap();
        let inner = FileArtifactStore::new(dir.path());
        let store = RedactingArtifactStore::new(inner);
        let body = json!({"note": "token=abcdefghij1234567890"});
        let artifact_ref = store
            .save_artifact("run_1", Phase::Translate, Some("fr"), 1, &body)
            .await
            .unwrap();
        let loaded = store.load_artifact(&artifact_ref).await.unwrap();
        assert!(!loaded["note"].as_str().unwrap().contains("abcdefghij1234567890"));
    }
}
