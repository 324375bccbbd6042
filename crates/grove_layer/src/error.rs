use grove_kv::KvError;
use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness check observed an existing row.
    #[error("duplicate key in unique index '{index_name}': {row}")]
    DuplicateKey { index_name: String, row: String },

    /// A persisted key failed to decode against its owning object's prefix.
    #[error("corrupt key: {0}")]
    CorruptKey(String),

    /// A persisted value failed to decode.
    #[error("corrupt value: {0}")]
    CorruptValue(String),

    /// A row required by a maintenance operation was not present.
    #[error("row not found under prefix {0}")]
    RowNotFound(String),

    /// The session was canceled, or a cooperative sleep was interrupted.
    #[error("query canceled")]
    QueryCanceled,

    /// Failure from the KV substrate. Retryable iff the wrapped error is.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A state the layer considers impossible; non-recoverable.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl StoreError {
    /// True only for wrapped `not_committed` / `commit_unknown_result`
    /// failures; everything else must surface to the statement.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Kv(err) => err.is_retryable(),
            _ => false,
        }
    }
}
