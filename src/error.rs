use thiserror::Error;

/// Failures surfaced by ledger, ingestion and storage operations.
///
/// Hitting the earnings cap is deliberately absent: it yields a zero reward
/// (`RewardDecision::Capped`) rather than an error.
#[derive(Debug, Error)]
pub enum StudyError {
    #[error("participant not found: {participant_id}")]
    NotFound { participant_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("concurrent update on {participant_id}: expected version {expected}, found {found}")]
    ConcurrencyConflict {
        participant_id: String,
        expected: u64,
        found: u64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type StudyResult<T> = Result<T, StudyError>;

impl StudyError {
    pub fn not_found(participant_id: &str) -> Self {
        StudyError::NotFound { participant_id: participant_id.to_string() }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StudyError::InvalidArgument(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StudyError::NotFound { .. } => "not_found",
            StudyError::InvalidArgument(_) => "invalid_argument",
            StudyError::ConcurrencyConflict { .. } => "concurrency_conflict",
            StudyError::Storage(_) => "storage",
            StudyError::Serde(_) => "serialization",
            StudyError::Internal(_) => "internal",
        }
    }

    /// HTTP-equivalent status for API collaborators.
    pub fn status_code(&self) -> u16 {
        match self {
            StudyError::NotFound { .. } => 404,
            StudyError::InvalidArgument(_) => 400,
            StudyError::ConcurrencyConflict { .. } => 409,
            _ => 500,
        }
    }

    /// Lost updates must be retried by the caller, never dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StudyError::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StudyError::not_found("p").status_code(), 404);
        assert_eq!(StudyError::invalid("bad task").status_code(), 400);
        let conflict = StudyError::ConcurrencyConflict {
            participant_id: "p".to_string(),
            expected: 1,
            found: 2,
        };
        assert_eq!(conflict.status_code(), 409);
        assert_eq!(StudyError::Internal("x".to_string()).status_code(), 500);
    }

    #[test]
    fn test_only_conflicts_retry() {
        let conflict = StudyError::ConcurrencyConflict {
            participant_id: "p".to_string(),
            expected: 3,
            found: 4,
        };
        assert!(conflict.is_retryable());
        assert!(!StudyError::not_found("p").is_retryable());
        assert!(!StudyError::invalid("x").is_retryable());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(StudyError::not_found("p").kind(), "not_found");
        assert_eq!(StudyError::invalid("x").kind(), "invalid_argument");
    }
}
