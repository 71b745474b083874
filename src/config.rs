//! The resolved configuration slice the orchestrator core consumes.
//!
//! The core never parses a config file itself (TOML/YAML parsing is an
//! external concern); callers resolve their own configuration surface and
//! hand the orchestrator a [`RunConfig`] built with the `with_*` methods
//! below, mirroring the teacher crate's `Config`/builder split.

use crate::model::Phase;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// What to do with untranslated records at export time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UntranslatedPolicy {
    Error,
    Warn,
    #[default]
    Allow,
}

/// Per-phase agent-pool tuning. Defaults match §6 of the spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseConfig {
    pub max_concurrent_chunks: usize,
    pub chunk_size: usize,
    pub max_chunk_retries: u32,
    pub request_timeout_s: u64,
    /// Open map of phase-specific parameters (severity mapping, min/max
    /// lines, etc.); content depends on the phase.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 4,
            chunk_size: 10,
            max_chunk_retries: 3,
            request_timeout_s: 60,
            parameters: BTreeMap::new(),
        }
    }
}

impl PhaseConfig {
    /// The default for `context`: one chunk per scene.
    pub fn per_scene() -> Self {
        Self {
            chunk_size: 1,
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent_chunks(mut self, n: usize) -> Self {
        self.max_concurrent_chunks = n;
        self
    }

    pub fn with_max_chunk_retries(mut self, n: u32) -> Self {
        self.max_chunk_retries = n;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// The resolved, typed configuration slice consumed by one run. This is the
/// output of whatever external loader (CLI flags, TOML file, environment)
/// an embedder uses; the core only ever sees this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub phases_enabled: Vec<Phase>,
    pub source_language: String,
    pub target_languages: Vec<String>,
    pub phase_configs: BTreeMap<Phase, PhaseConfig>,
    pub untranslated_policy: UntranslatedPolicy,
    pub workspace_dir: String,
    pub logs_dir: String,
    #[serde(default)]
    pub determinism_seed: Option<u64>,
}

impl RunConfig {
    pub fn new(source_language: impl Into<String>, target_languages: Vec<String>) -> Self {
        Self {
            phases_enabled: Phase::CANONICAL_ORDER.to_vec(),
            source_language: source_language.into(),
            target_languages,
            phase_configs: BTreeMap::new(),
            untranslated_policy: UntranslatedPolicy::default(),
            workspace_dir: ".rentl".to_string(),
            logs_dir: "logs".to_string(),
            determinism_seed: None,
        }
    }

    pub fn with_phases_enabled(mut self, phases: Vec<Phase>) -> Self {
        self.phases_enabled = phases;
        self
    }

    pub fn with_phase_config(mut self, phase: Phase, config: PhaseConfig) -> Self {
        self.phase_configs.insert(phase, config);
        self
    }

    pub fn with_untranslated_policy(mut self, policy: UntranslatedPolicy) -> Self {
        self.untranslated_policy = policy;
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<String>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_logs_dir(mut self, dir: impl Into<String>) -> Self {
        self.logs_dir = dir.into();
        self
    }

    pub fn is_phase_enabled(&self, phase: Phase) -> bool {
        self.phases_enabled.contains(&phase)
    }

    pub fn phase_config(&self, phase: Phase) -> PhaseConfig {
        self.phase_configs.get(&phase).cloned().unwrap_or_else(|| {
            if phase == Phase::Context {
                PhaseConfig::per_scene()
            } else {
                PhaseConfig::default()
            }
        })
    }

    /// A stable hash of the declarative configuration that affects a given
    /// phase's output (model choice, chunk size, prompt profile version,
    /// agent parameters), excluding secrets and file paths. Used by the
    /// staleness engine to decide whether a phase's inputs changed even when
    /// its upstream revisions did not.
    pub fn phase_fingerprint(&self, phase: Phase) -> String {
        let phase_config = self.phase_config(phase);
        let mut hasher = Sha256::new();
        hasher.update(phase.as_str().as_bytes());
        hasher.update(phase_config.chunk_size.to_le_bytes());
        hasher.update(phase_config.max_concurrent_chunks.to_le_bytes());
        hasher.update(phase_config.max_chunk_retries.to_le_bytes());
        // BTreeMap iterates in sorted key order, so this is stable.
        for (key, value) in &phase_config.parameters {
            hasher.update(key.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }
        if phase == Phase::Export {
            hasher.update(format!("{:?}", self.untranslated_policy).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// The whole-config fingerprint recorded on `RunState::config_fingerprint`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for phase in &self.phases_enabled {
            hasher.update(self.phase_fingerprint(*phase).as_bytes());
        }
        hasher.update(self.source_language.as_bytes());
        for lang in &self.target_languages {
            hasher.update(lang.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_config() {
        let a = RunConfig::new("en", vec!["fr".into()]);
        let b = RunConfig::new("en", vec!["fr".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_chunk_size() {
        let base = RunConfig::new("en", vec!["fr".into()]);
        let changed = base
            .clone()
            .with_phase_config(Phase::Translate, PhaseConfig::default().with_chunk_size(20));
        assert_ne!(base.fingerprint(), changed.fingerprint());
        assert_ne!(
            base.phase_fingerprint(Phase::Translate),
            changed.phase_fingerprint(Phase::Translate)
        );
    }

    #[test]
    fn unaffected_phase_fingerprint_is_unchanged() {
        let base = RunConfig::new("en", vec!["fr".into()]);
        let changed = base
            .clone()
            .with_phase_config(Phase::Translate, PhaseConfig::default().with_chunk_size(20));
        assert_eq!(
            base.phase_fingerprint(Phase::Qa),
            changed.phase_fingerprint(Phase::Qa)
        );
    }

    #[test]
    fn context_defaults_to_per_scene_chunking() {
        let config = RunConfig::new("en", vec![]);
        assert_eq!(config.phase_config(Phase::Context).chunk_size, 1);
        assert_eq!(config.phase_config(Phase::Translate).chunk_size, 10);
    }
}
