use thiserror::Error;

use crate::types::ActivityId;

/// Storage-layer failure. `Conflict` is the optimistic-versioning signal the
/// engine re-runs transactions on; everything else is surfaced as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic lock conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("storage backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Engine failure taxonomy. The scheduler pattern-matches these instead of
/// inspecting exception type hierarchies:
///
/// - `Structural` is non-retryable (missing activity, malformed definition
///   state, a job that no longer matches its execution). Surfaces to the
///   synchronous caller immediately; on the async path it goes terminal in
///   one step.
/// - `Delegate` wraps business code failures and is retryable per the job's
///   retry policy; exhausting retries produces an Incident.
/// - `Conflict` means the whole atomic-operation transaction must be re-run
///   from its last durable checkpoint. Synchronous callers retry with no
///   cap; an async job is unlocked and re-queued without penalty.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("structural fault: {0}")]
    Structural(String),

    #[error("delegate '{delegate}' failed at activity '{activity_id}': {source:#}")]
    Delegate {
        delegate: String,
        activity_id: ActivityId,
        #[source]
        source: anyhow::Error,
    },

    #[error("concurrent modification, operation must be re-run")]
    Conflict,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => EngineError::Conflict,
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Business failures are retried per the job's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Delegate { .. })
    }

    /// Transient failures (version conflicts, backend hiccups) re-queue the
    /// job without touching its retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Conflict | EngineError::Store(_))
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        EngineError::Structural(msg.into())
    }
}

/// Render an error and its source chain for the out-of-line stacktrace
/// column on failed jobs.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(src) = cur {
        out.push_str("\ncaused by: ");
        out.push_str(&src.to_string());
        cur = src.source();
    }
    out
}
