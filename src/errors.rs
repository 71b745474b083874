//! Error taxonomy for the orchestrator core.
//!
//! Every error surfaced to a caller carries a stable machine-readable `code`,
//! a human `message`, a suggested `next_action`, and phase/language/line
//! context where applicable, per the error handling design.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase/language/line/scene context attached to a surfaced error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
}

impl ErrorContext {
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
            ..Default::default()
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_line_id(mut self, line_id: impl Into<String>) -> Self {
        self.line_id = Some(line_id.into());
        self
    }

    pub fn with_scene_id(mut self, scene_id: impl Into<String>) -> Self {
        self.scene_id = Some(scene_id.into());
        self
    }
}

/// The structured error recorded on a failed `PhaseRunRecord` and returned
/// to callers. `code` matches one of the [`ErrorKind`] variants' snake_case
/// name; `next_action` is a short actionable suggestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub next_action: String,
    #[serde(default, skip_serializing_if = "ErrorContext::is_empty")]
    pub context: ErrorContext,
}

impl ErrorContext {
    fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.language.is_none()
            && self.line_id.is_none()
            && self.scene_id.is_none()
    }
}

/// The error taxonomy from the error handling design: eight kinds, each with
/// its own fatality and retry semantics documented on the variant.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Invalid or missing configuration. Local to setup; fatal to the run
    /// before phases start.
    #[error("config error: {message}")]
    Config {
        message: String,
        context: ErrorContext,
    },

    /// Input violates a schema or an invariant (row/field position included).
    #[error("validation error: {message}")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    /// I/O or format error reading source lines.
    #[error("ingest error: {message}")]
    Ingest {
        message: String,
        context: ErrorContext,
    },

    /// I/O or format error writing translated output.
    #[error("export error: {message}")]
    Export {
        message: String,
        context: ErrorContext,
    },

    /// Dependency not satisfied or an orchestration invariant violated (e.g.
    /// an agent returned duplicate line_ids that survive retries).
    #[error("orchestration error: {message}")]
    Orchestration {
        message: String,
        context: ErrorContext,
    },

    /// LLM runtime unreachable or unauthorized.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        context: ErrorContext,
    },

    /// Persistence failed after retries. Fatal to the run.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Cooperative cancellation. Not a bug.
    #[error("cancelled: {message}")]
    Cancelled {
        message: String,
        context: ErrorContext,
    },

    /// Unexpected failure, converted to a phase failure.
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl OrchestratorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn orchestration(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Orchestration {
            message: message.into(),
            context,
        }
    }

    pub fn storage(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Storage {
            message: message.into(),
            context: ErrorContext::default(),
            source: Some(source),
        }
    }

    pub fn cancelled(context: ErrorContext) -> Self {
        Self::Cancelled {
            message: "run cancelled".to_string(),
            context,
        }
    }

    /// The stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::Validation { .. } => "validation_error",
            Self::Ingest { .. } => "ingest_error",
            Self::Export { .. } => "export_error",
            Self::Orchestration { .. } => "orchestration_error",
            Self::Connection { .. } => "connection_error",
            Self::Storage { .. } => "storage_error",
            Self::Cancelled { .. } => "cancelled",
            Self::Runtime { .. } => "runtime_error",
        }
    }

    pub fn next_action(&self) -> &'static str {
        match self {
            Self::Config { .. } => "fix the configuration and retry",
            Self::Validation { .. } => "correct the offending input and re-ingest",
            Self::Ingest { .. } => "check the source file and re-ingest",
            Self::Export { .. } => "check the export target and rerun export",
            Self::Orchestration { .. } => "rerun the upstream phase",
            Self::Connection { .. } => "run validate-connection and retry",
            Self::Storage { .. } => "check storage availability and retry",
            Self::Cancelled { .. } => "rerun when ready",
            Self::Runtime { .. } => "inspect the log for a stack trace and file a bug",
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Validation { context, .. }
            | Self::Ingest { context, .. }
            | Self::Export { context, .. }
            | Self::Orchestration { context, .. }
            | Self::Connection { context, .. }
            | Self::Storage { context, .. }
            | Self::Cancelled { context, .. }
            | Self::Runtime { context, .. } => context,
        }
    }

    /// Render as the structured `ErrorDetail` persisted on a `PhaseRunRecord`.
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
            next_action: self.next_action().to_string(),
            context: self.context().clone(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (next: {})", self.code, self.message, self.next_action)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
