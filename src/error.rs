use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

/// Errors surfaced by the engine. Validation problems are aggregated into a
/// single `ValidationFailed` carrying every diagnostic found during the
/// commit pass; everything else is immediate.
#[derive(Debug, Error)]
pub enum CairnError {
    /// The transaction was used after close, or from a thread other than the
    /// one that opened it. Cross-thread use is indistinguishable from
    /// use-after-close and is reported as such.
    #[error("the transaction for keyspace [{keyspace}] is closed; use the session to open a new one")]
    TransactionClosed { keyspace: String },

    #[error("the transaction for keyspace [{keyspace}] is read only")]
    ReadOnly { keyspace: String },

    #[error("cannot commit: read-only transaction for keyspace [{keyspace}] has staged mutations")]
    ReadOnlyCommit { keyspace: String },

    #[error("a transaction is already open on this thread for keyspace [{keyspace}]; close it before opening another")]
    ConcurrentTransactionOnThread { keyspace: String },

    #[error("the session for keyspace [{keyspace}] is closed; create a new session")]
    SessionClosed { keyspace: String },

    #[error("the server is closed")]
    ServerClosed,

    #[error("commit validation failed with {} error(s): {}", .0.len(), .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("exhausted id pool for partition({partition})-namespace({namespace})")]
    PoolExhausted { partition: u32, namespace: u32 },

    #[error("id block allocation on partition({partition})-namespace({namespace}) timed out after {millis}ms")]
    PoolTimeout {
        partition: u32,
        namespace: u32,
        millis: u64,
    },

    #[error("could not acquire id block from backend: {0}")]
    PoolBackend(String),

    #[error("id pool for partition({partition})-namespace({namespace}) is closed")]
    PoolClosed { partition: u32, namespace: u32 },

    /// A blocking wait was abandoned because the resource it waited on was
    /// torn down underneath it.
    #[error("interrupted while waiting: {0}")]
    Interrupted(&'static str),

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CairnError {
    /// True for failures a caller may retry without reopening anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CairnError::PoolBackend(_))
    }
}
