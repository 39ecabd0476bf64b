use thiserror::Error;

use crate::{
    dao::storage::StorageError,
    messaging::{ChatId, MessagingError},
    rating::MergeError,
    state::matches::RuleViolation,
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Another writer committed the same match first.
    #[error("concurrent update: {0}")]
    Conflict(#[source] StorageError),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// A business rule refused the action; `destination` is where the user
    /// should be told.
    #[error("{violation}")]
    Rejected {
        /// Chat the explanation is addressed to.
        destination: ChatId,
        /// Rule that was violated.
        violation: RuleViolation,
    },
    /// The messaging collaborator failed.
    #[error("messaging call failed")]
    Messaging(#[from] MessagingError),
    /// Rating merge preconditions were not met.
    #[error("rating merge refused")]
    Merge(#[from] MergeError),
}

impl ServiceError {
    /// Build a user-facing rejection.
    pub fn rejected(destination: ChatId, violation: impl Into<RuleViolation>) -> Self {
        ServiceError::Rejected {
            destination,
            violation: violation.into(),
        }
    }

    /// Whether the error is a user-facing rule violation rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ServiceError::Rejected { .. })
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => ServiceError::Conflict(err),
            StorageError::Missing(what) => ServiceError::NotFound(what),
            StorageError::Unavailable { .. } => ServiceError::Unavailable(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::state_machine::MatchState;

    #[test]
    fn storage_errors_are_classified() {
        let conflict = StorageError::Conflict {
            entity: "match".into(),
            expected: 1,
            actual: 2,
        };
        assert!(matches!(
            ServiceError::from(conflict),
            ServiceError::Conflict(_)
        ));
        assert!(matches!(
            ServiceError::from(StorageError::Missing("task".into())),
            ServiceError::NotFound(message) if message == "task"
        ));
    }

    #[test]
    fn rejection_displays_the_rule() {
        let err = ServiceError::rejected(42, RuleViolation::MatchClosed(MatchState::Finished));
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), RuleViolation::MatchClosed(MatchState::Finished).to_string());
    }
}
