use thiserror::Error;

/// Error code reported for optimistic-validation failures at commit.
pub const CODE_NOT_COMMITTED: i32 = 1020;
/// Error code reported when a commit's outcome could not be determined.
pub const CODE_COMMIT_UNKNOWN_RESULT: i32 = 1021;

/// Errors surfaced by the KV substrate.
#[derive(Debug, Error)]
pub enum KvError {
    /// The transaction's read set was invalidated by a concurrent commit.
    #[error("transaction not committed: conflicting write detected")]
    NotCommitted,

    /// The commit may or may not have been applied.
    #[error("transaction commit result unknown")]
    CommitUnknownResult,

    /// The transaction was already committed and must be reset before reuse.
    #[error("transaction used after commit")]
    UsedAfterCommit,

    /// A stored byte sequence failed to decode.
    #[error("malformed tuple encoding: {0}")]
    Corrupt(String),

    /// A directory-layer operation failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// The underlying storage engine reported a failure.
    #[error("storage engine error: {0}")]
    Engine(String),
}

impl KvError {
    /// Numeric code of the error, mirroring the store's wire codes where one
    /// exists. Unknown/local failures report 0.
    pub fn code(&self) -> i32 {
        match self {
            KvError::NotCommitted => CODE_NOT_COMMITTED,
            KvError::CommitUnknownResult => CODE_COMMIT_UNKNOWN_RESULT,
            _ => 0,
        }
    }

    /// Only `not_committed` and `commit_unknown_result` warrant a retry by an
    /// outer transaction loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::NotCommitted | KvError::CommitUnknownResult
        )
    }
}

impl From<fjall::Error> for KvError {
    fn from(err: fjall::Error) -> Self {
        KvError::Engine(err.to_string())
    }
}
