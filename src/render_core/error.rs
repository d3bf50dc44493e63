use thiserror::Error;

use super::domain::JobStatus;

/// Typed failures surfaced by the public API and the stage boundary. The
/// scheduler converts every non-`Cancelled` stage failure into a retry or a
/// dead-letter transition; `Cancelled` passes through untouched and never
/// counts against the retry budget.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("operation not valid while job is {status:?}")]
    WrongStatus { status: JobStatus },

    #[error("illegal status transition {from:?} -> {to:?}")]
    Conflict { from: JobStatus, to: JobStatus },

    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("external process failed: {0}")]
    Process(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store failure: {0}")]
    Store(String),

    #[error("crash recovery failed: {0}")]
    Recovery(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Short machine-friendly kind tag carried on failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidJob(_) => "input",
            EngineError::NotFound(_) => "not-found",
            EngineError::WrongStatus { .. } => "wrong-status",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Preflight(_) => "preflight",
            EngineError::Process(_) => "process",
            EngineError::Cancelled => "cancelled",
            EngineError::Store(_) => "store",
            EngineError::Recovery(_) => "recovery",
        }
    }
}
