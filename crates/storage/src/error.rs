use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// Optimistic-concurrency conflict: the candidate already carries a
    /// decision. Never retried.
    #[error("candidate {candidate_id} is already decided")]
    AlreadyDecided { candidate_id: i64 },
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },
    /// Row state changed underneath the operation (e.g. already imported).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid stored data: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn not_found(what: &'static str, id: i64) -> Self {
        StorageError::NotFound { what, id }
    }
}
