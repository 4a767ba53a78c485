//! Error types for intake validation, storage collaborators and the pipeline.

/// Malformed rebalance input, rejected before it reaches the pipeline. Never retried.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("user_id is required")]
    MissingUserId,

    #[error("asset id must not be empty")]
    EmptyAsset,

    #[error("weight for {0} is not a finite number")]
    NonFiniteWeight(String),

    #[error("weight for {asset} ({weight}) is negative")]
    NegativeWeight { asset: String, weight: f64 },

    #[error("weight for {asset} ({weight}) exceeds 100%")]
    WeightOutOfRange { asset: String, weight: f64 },

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Failure reported by a ledger or transaction store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The write may succeed if attempted again (timeouts, 5xx, throttling).
    #[error("transient storage error: {0}")]
    Transient(String),

    /// A bulk write where some documents were rejected. Reported as one aggregate.
    #[error("bulk write partially failed: {failed}/{total} documents rejected: {reason}")]
    Partial {
        failed: usize,
        total: usize,
        reason: String,
    },

    /// Retrying will not help (bad request, mapping conflict, corrupt state).
    #[error("storage error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether the retry loop should attempt the write again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Partial { .. })
    }
}

/// Why a pipeline invocation ended in `Failed`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Ledger read or write failed; nothing was diffed or persisted.
    #[error("ledger unavailable: {0}")]
    Ledger(StoreError),

    #[error("transaction write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },

    /// The store returned a non-retryable error.
    #[error("transaction write rejected: {0}")]
    Rejected(StoreError),

    #[error("cancelled before the transaction write completed")]
    Cancelled,
}

impl PipelineError {
    /// True when computed transactions were never confirmed as stored while the
    /// ledger already advanced past the request.
    pub fn is_data_loss(&self) -> bool {
        !matches!(self, PipelineError::Ledger(_))
    }
}
