//! The Agent Pool: bounded-concurrency chunked dispatch with per-chunk
//! retries and strict input/output ID alignment.
//!
//! Mirrors the teacher's `dag/executor.rs` wave-dispatch shape (an
//! `Arc<Semaphore>` gating in-flight work, tasks tracked until they finish)
//! but one level down: here the unit of work is a chunk of typed phase
//! input rather than a whole DAG phase.

use crate::errors::{ErrorContext, OrchestratorError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Items processed by the Agent Pool carry an identifier the alignment
/// check compares between chunk input and chunk output.
pub trait Identified {
    fn item_id(&self) -> &str;
}

/// One deterministic partition of a phase's input list. `index` fixes the
/// chunk's position in the stable order so progress and diagnostics can
/// refer to "chunk 3 of 12" even while chunks complete out of order.
#[derive(Debug, Clone)]
pub struct Chunk<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// Partition `items` into chunks of `chunk_size`, preserving input order.
/// `chunk_size == 0` is treated as "one chunk per item" (used by `context`,
/// which chunks one scene at a time).
pub fn partition<T>(items: Vec<T>, chunk_size: usize) -> Vec<Chunk<T>> {
    let size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut index = 0;

    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(Chunk {
                index,
                items: std::mem::take(&mut current),
            });
            index += 1;
        }
    }
    if !current.is_empty() {
        chunks.push(Chunk { index, items: current });
    }
    chunks
}

/// What went wrong executing one chunk against the LLM runtime, before any
/// alignment check. The pool itself produces [`ChunkFailure::Alignment`]
/// after inspecting the executor's output.
#[derive(Debug, Clone)]
pub enum ChunkFailure {
    SchemaInvalid { message: String },
    Runtime(String),
    Alignment {
        missing: Vec<String>,
        extra: Vec<String>,
        duplicate: Vec<String>,
    },
}

impl ChunkFailure {
    fn feedback(&self) -> String {
        match self {
            ChunkFailure::SchemaInvalid { message } => {
                format!("Your previous response was not valid for the expected schema: {message}. Repair it and resend the full payload.")
            }
            ChunkFailure::Runtime(message) => {
                format!("The previous attempt failed: {message}. Retry the same chunk.")
            }
            ChunkFailure::Alignment { missing, extra, duplicate } => {
                let mut parts = Vec::new();
                if !missing.is_empty() {
                    parts.push(format!("missing ids: {}", missing.join(", ")));
                }
                if !extra.is_empty() {
                    parts.push(format!("extra ids: {}", extra.join(", ")));
                }
                if !duplicate.is_empty() {
                    parts.push(format!("duplicate ids: {}", duplicate.join(", ")));
                }
                format!(
                    "Your previous response's ids did not match the input ids ({}). Return exactly one output per input id, no more, no fewer.",
                    parts.join("; ")
                )
            }
        }
    }
}

/// Executes one chunk: renders the prompt, invokes the LLM runtime, and
/// returns the typed output items. Implementations own the prompt template
/// and the `LlmRuntime` call; the pool only drives chunking, concurrency,
/// retries, and alignment.
#[async_trait]
pub trait ChunkExecutor<T, U>: Send + Sync
where
    T: Send + Sync,
    U: Send + Sync,
{
    async fn execute(
        &self,
        chunk: &[T],
        feedback: Option<&str>,
    ) -> Result<Vec<U>, ChunkFailure>;
}

/// Pool tuning, mirrors [`crate::config::PhaseConfig`]'s concurrency fields.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_concurrent_chunks: usize,
    pub max_chunk_retries: u32,
}

impl From<&crate::config::PhaseConfig> for PoolConfig {
    fn from(config: &crate::config::PhaseConfig) -> Self {
        Self {
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            max_chunk_retries: config.max_chunk_retries,
        }
    }
}

/// Result of running a whole phase's chunks. `completed_chunks` is
/// retained (in chunk order) even on failure, since the spec asks for
/// partial diagnostic persistence of successfully completed chunks when a
/// later chunk fails the phase.
pub struct PoolOutcome<U> {
    pub completed_chunks: Vec<Chunk<U>>,
    pub chunks_attempted: usize,
}

/// Observes chunk completions as they land, used to emit the milestone
/// `ProgressUpdate` the spec requires after every chunk (success or
/// failure).
#[async_trait]
pub trait ChunkObserver: Send + Sync {
    async fn on_chunk_completed(&self, chunk_index: usize, items_produced: usize, succeeded: bool);
}

/// A phase's chunked execution failed. Carries the error from the first
/// chunk that exhausted its retries, plus whatever chunks had already
/// completed (in chunk order) so a caller can persist them as a diagnostic
/// artifact under the failed revision instead of discarding them.
pub struct PoolFailure<U> {
    pub error: OrchestratorError,
    pub partial: PoolOutcome<U>,
}

/// Run one phase's chunked work to completion or to the first unrecoverable
/// chunk failure.
///
/// On the first chunk that exhausts its retries, the whole phase fails:
/// per §4.2's failure policy, a chunk failure fails the entire phase for
/// that language. Chunks already in flight are allowed to finish (their
/// permits are already acquired) but no further chunks are dispatched.
pub async fn run_phase<T, U, E>(
    items: Vec<T>,
    chunk_size: usize,
    pool_config: PoolConfig,
    executor: Arc<E>,
    observer: Arc<dyn ChunkObserver>,
    context: ErrorContext,
) -> Result<PoolOutcome<U>, PoolFailure<U>>
where
    T: Identified + Clone + Send + Sync + 'static,
    U: Identified + Send + Sync + 'static,
    E: ChunkExecutor<T, U> + 'static,
{
    let chunks = partition(items, chunk_size);
    let total = chunks.len();
    let semaphore = Arc::new(Semaphore::new(pool_config.max_concurrent_chunks));
    let mut tasks = Vec::with_capacity(total);

    for chunk in chunks {
        let semaphore = Arc::clone(&semaphore);
        let executor = Arc::clone(&executor);
        let observer = Arc::clone(&observer);
        let context = context.clone();
        let retries = pool_config.max_chunk_retries;

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed while tasks are outstanding");
            let result = run_one_chunk(&chunk, executor.as_ref(), retries, &context).await;
            let (succeeded, produced) = match &result {
                Ok(items) => (true, items.len()),
                Err(_) => (false, 0),
            };
            observer.on_chunk_completed(chunk.index, produced, succeeded).await;
            (chunk.index, result)
        }));
    }

    let mut completed_chunks: Vec<Chunk<U>> = Vec::new();
    let mut first_failure: Option<OrchestratorError> = None;
    let mut attempted = 0usize;

    // All chunks are already spawned and running against the shared
    // semaphore; join_all here just waits for the lot, same shape as the
    // specialist fan-in in the teacher's review dispatcher.
    for joined in futures::future::join_all(tasks).await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                let err = OrchestratorError::Runtime {
                    message: format!("chunk task panicked: {join_err}"),
                    context: context.clone(),
                    source: None,
                };
                completed_chunks.sort_by_key(|c| c.index);
                return Err(PoolFailure {
                    error: err,
                    partial: PoolOutcome {
                        completed_chunks,
                        chunks_attempted: attempted,
                    },
                });
            }
        };
        attempted += 1;
        match result {
            Ok(items) => completed_chunks.push(Chunk { index, items }),
            Err(err) if first_failure.is_none() => first_failure = Some(err),
            Err(_) => {}
        }
    }

    completed_chunks.sort_by_key(|c| c.index);

    if let Some(err) = first_failure {
        return Err(PoolFailure {
            error: err,
            partial: PoolOutcome {
                completed_chunks,
                chunks_attempted: attempted,
            },
        });
    }

    Ok(PoolOutcome {
        completed_chunks,
        chunks_attempted: attempted,
    })
}

async fn run_one_chunk<T, U, E>(
    chunk: &Chunk<T>,
    executor: &E,
    max_retries: u32,
    context: &ErrorContext,
) -> Result<Vec<U>, OrchestratorError>
where
    T: Identified + Clone,
    U: Identified,
    E: ChunkExecutor<T, U>,
{
    let input_ids: HashSet<String> = chunk.items.iter().map(|i| i.item_id().to_string()).collect();
    let mut feedback: Option<String> = None;
    let mut last_failure: Option<ChunkFailure> = None;

    for attempt in 0..=max_retries {
        let attempt_feedback = feedback.as_deref();
        match executor.execute(&chunk.items, attempt_feedback).await {
            Ok(output) => match check_alignment(&input_ids, &output) {
                Ok(()) => return Ok(output),
                Err(failure) => {
                    feedback = Some(failure.feedback());
                    last_failure = Some(failure);
                }
            },
            Err(failure) => {
                feedback = Some(failure.feedback());
                last_failure = Some(failure);
            }
        }
        if attempt == max_retries {
            break;
        }
    }

    let failure = last_failure.expect("loop always executes at least once");
    Err(chunk_failure_to_error(chunk.index, failure, context))
}

fn check_alignment<T, U>(input_ids: &HashSet<String>, output: &[U]) -> Result<(), ChunkFailure>
where
    U: Identified,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicate = Vec::new();
    for item in output {
        let id = item.item_id().to_string();
        if !seen.insert(id.clone()) {
            duplicate.push(id);
        }
    }

    let output_ids: HashSet<String> = output.iter().map(|i| i.item_id().to_string()).collect();
    let mut missing: Vec<String> = input_ids.difference(&output_ids).cloned().collect();
    let mut extra: Vec<String> = output_ids.difference(input_ids).cloned().collect();
    missing.sort();
    extra.sort();
    duplicate.sort();

    if missing.is_empty() && extra.is_empty() && duplicate.is_empty() {
        Ok(())
    } else {
        Err(ChunkFailure::Alignment { missing, extra, duplicate })
    }
}

fn chunk_failure_to_error(chunk_index: usize, failure: ChunkFailure, context: &ErrorContext) -> OrchestratorError {
    let message = match &failure {
        ChunkFailure::SchemaInvalid { message } => format!("chunk {chunk_index}: schema-invalid payload after retries: {message}"),
        ChunkFailure::Runtime(message) => format!("chunk {chunk_index}: runtime failure after retries: {message}"),
        ChunkFailure::Alignment { missing, extra, duplicate } => format!(
            "chunk {chunk_index}: id alignment failed after retries (missing={missing:?}, extra={extra:?}, duplicate={duplicate:?})"
        ),
    };
    OrchestratorError::Orchestration {
        message,
        context: context.clone(),
    }
}
