use thiserror::Error;

/// All errors that Satchel can produce.
#[derive(Debug, Error)]
pub enum SatchelError {
    /// Low-level storage failure: SQL errors, blob I/O, schema mismatch.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("conflict: document update conflict")]
    Conflict,

    /// A non-deleted revision already exists for this document id.
    #[error("document already exists: {0}")]
    DocumentExists(String),

    #[error("document not found: {0}")]
    DocumentMissing(String),

    /// Malformed remote response or protocol schema mismatch. Fatal to the
    /// current replication.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transient network failure (timeout, connect error, 5xx, 429). Retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// 401/403 after the interceptor-driven replay was spent.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Cooperative cancellation observed.
    #[error("cancelled")]
    Cancelled,

    /// Replicator lifecycle violation, e.g. `start()` on a finished run.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid revision format: {0}")]
    InvalidRev(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SatchelError {
    /// Whether a replication batch may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SatchelError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, SatchelError>;
