//! The staleness engine: given a `RunState`, computes which `(phase,
//! language)` records are stale relative to their upstream revisions and
//! config fingerprint, and marks them.
//!
//! Runs synchronously whenever a new `PhaseRunRecord` is appended or the
//! config fingerprint changes. Does not itself re-run anything; the
//! orchestrator consults the result on its next pass.

use crate::config::RunConfig;
use crate::model::{Phase, PhaseStatus, RunState};
use std::collections::HashSet;

/// One `(phase, language)` key newly marked stale by a call to
/// [`recompute`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaleKey {
    pub phase: Phase,
    pub target_language: Option<String>,
}

/// Recompute staleness across the whole `RunState` and flip the `stale`
/// flag on every newly-staled record. Returns the set of `(phase,
/// language)` keys that transitioned from non-stale to stale in this call
/// (these are the ones that should emit `phase_invalidated`); calling this
/// again with no intervening change returns an empty set (idempotent).
///
/// A record `R` is stale iff any of its recorded dependencies references an
/// upstream `(phase, language, revision)` where the latest completed
/// revision for that upstream is now greater than the recorded one, or the
/// config fingerprint for `R`'s own phase has changed since it ran.
pub fn recompute(state: &mut RunState, config: &RunConfig) -> HashSet<StaleKey> {
    let mut newly_staled = HashSet::new();

    // Staleness is transitive: walk the canonical phase order forward so
    // that a phase staled earlier in this same pass is visible to phases
    // that depend on it later in the pass.
    for phase in Phase::CANONICAL_ORDER {
        let languages: Vec<Option<String>> = if phase.is_language_specific() {
            config.target_languages.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        };

        for language in languages {
            let indices: Vec<usize> = state
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.phase == phase
                        && r.target_language == language
                        && r.status == PhaseStatus::Completed
                        && !r.stale
                })
                .map(|(i, _)| i)
                .collect();

            for idx in indices {
                let record = &state.records[idx];
                let config_changed = record
                    .summary
                    .get("config_fingerprint")
                    .and_then(|v| v.as_str())
                    .map(|fp| fp != config.phase_fingerprint(phase))
                    .unwrap_or(false);

                let dependency_stale = record.dependencies.iter().any(|dep| {
                    let latest = latest_usable_revision(state, dep.upstream_phase, dep.upstream_language.as_deref());
                    latest > dep.upstream_revision
                });

                if config_changed || dependency_stale {
                    state.records[idx].stale = true;
                    newly_staled.insert(StaleKey {
                        phase,
                        target_language: language.clone(),
                    });
                }
            }
        }
    }

    newly_staled
}

fn latest_usable_revision(state: &RunState, phase: Phase, language: Option<&str>) -> u64 {
    state
        .latest_usable_record(phase, language)
        .map(|r| r.revision)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyRef, PhaseRunRecord, RunState};
    use chrono::Utc;
    use std::collections::BTreeMap as Map;

    fn completed_record(phase: Phase, language: Option<&str>, revision: u64, deps: Vec<DependencyRef>) -> PhaseRunRecord {
        PhaseRunRecord {
            phase,
            target_language: language.map(|s| s.to_string()),
            revision,
            status: PhaseStatus::Completed,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            dependencies: deps,
            artifact_refs: vec![],
            summary: Map::new(),
            error: None,
            stale: false,
        }
    }

    #[test]
    fn reruns_upstream_stales_downstream_transitively() {
        let config = RunConfig::new("en", vec!["fr".into()]);
        let mut state = RunState::new("run_1", Utc::now(), config.fingerprint());

        state.records.push(completed_record(Phase::Ingest, None, 1, vec![]));
        state.records.push(completed_record(
            Phase::Context,
            None,
            1,
            vec![DependencyRef {
                upstream_phase: Phase::Ingest,
                upstream_language: None,
                upstream_revision: 1,
            }],
        ));
        state.records.push(completed_record(
            Phase::Translate,
            Some("fr"),
            1,
            vec![
                DependencyRef {
                    upstream_phase: Phase::Ingest,
                    upstream_language: None,
                    upstream_revision: 1,
                },
                DependencyRef {
                    upstream_phase: Phase::Context,
                    upstream_language: None,
                    upstream_revision: 1,
                },
            ],
        ));

        // A second context run bumps its revision.
        state.records.push(completed_record(Phase::Context, None, 2, vec![]));

        let staled = recompute(&mut state, &config);
        assert!(staled.contains(&StaleKey {
            phase: Phase::Translate,
            target_language: Some("fr".into())
        }));

        let translate_record = state
            .records
            .iter()
            .find(|r| r.phase == Phase::Translate && r.revision == 1)
            .unwrap();
        assert!(translate_record.stale);
    }

    #[test]
    fn recompute_is_idempotent() {
        let config = RunConfig::new("en", vec!["fr".into()]);
        let mut state = RunState::new("run_1", Utc::now(), config.fingerprint());
        state.records.push(completed_record(Phase::Ingest, None, 1, vec![]));
        state.records.push(completed_record(
            Phase::Context,
            None,
            1,
            vec![DependencyRef {
                upstream_phase: Phase::Ingest,
                upstream_language: None,
                upstream_revision: 1,
            }],
        ));
        state.records.push(completed_record(Phase::Ingest, None, 2, vec![]));

        let first = recompute(&mut state, &config);
        assert_eq!(first.len(), 1);

        let second = recompute(&mut state, &config);
        assert!(second.is_empty(), "already-stale records must not re-fire");
    }

    #[test]
    fn unrelated_phase_is_unaffected() {
        let config = RunConfig::new("en", vec!["fr".into(), "de".into()]);
        let mut state = RunState::new("run_1", Utc::now(), config.fingerprint());
        state.records.push(completed_record(Phase::Ingest, None, 1, vec![]));
        state.records.push(completed_record(
            Phase::Translate,
            Some("fr"),
            1,
            vec![DependencyRef {
                upstream_phase: Phase::Ingest,
                upstream_language: None,
                upstream_revision: 1,
            }],
        ));
        state.records.push(completed_record(
            Phase::Translate,
            Some("de"),
            1,
            vec![DependencyRef {
                upstream_phase: Phase::Ingest,
                upstream_language: None,
                upstream_revision: 1,
            }],
        ));
        state.records.push(completed_record(Phase::Ingest, None, 2, vec![]));

        let staled = recompute(&mut state, &config);
        assert_eq!(staled.len(), 2);
        assert!(staled.contains(&StaleKey { phase: Phase::Translate, target_language: Some("fr".into()) }));
        assert!(staled.contains(&StaleKey { phase: Phase::Translate, target_language: Some("de".into()) }));
    }
}
