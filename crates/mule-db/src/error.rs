//! Store error kinds.
//!
//! Callers must branch on the kind: `Unavailable` is retried in place,
//! `Conflict` means re-read and re-decide, `NotFound` is fatal for the
//! operation that raised it.

use uuid::Uuid;

/// Error returned by every store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport-level failure (connection lost, pool exhausted, query
    /// failed for infrastructure reasons). Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// A compare-and-swap matched zero rows: the record's state moved
    /// under us. The caller re-reads and decides.
    #[error("conflicting state for {id}: expected {expected}")]
    Conflict { id: Uuid, expected: String },

    /// The referenced record does not exist.
    #[error("record {0} not found")]
    NotFound(Uuid),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err)
    }
}

impl StoreError {
    /// Whether a caller should retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Construct a conflict error for a failed CAS.
    pub fn conflict(id: Uuid, expected: impl Into<String>) -> Self {
        StoreError::Conflict {
            id,
            expected: expected.into(),
        }
    }
}

/// Result alias used throughout the store layer.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_transient() {
        let err = StoreError::Unavailable(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn conflict_is_not_transient() {
        let err = StoreError::conflict(Uuid::new_v4(), "pending");
        assert!(!err.is_transient());
    }

    #[test]
    fn conflict_message_names_expected_state() {
        let id = Uuid::new_v4();
        let msg = StoreError::conflict(id, "running").to_string();
        assert!(msg.contains("running"), "unexpected message: {msg}");
        assert!(msg.contains(&id.to_string()));
    }
}
