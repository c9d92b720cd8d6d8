//! Error types for tributary.
//!
//! All errors in tributary are strongly typed using thiserror.
//! Registration problems surface while the application is being defined,
//! execution problems surface while a pipeline is running.

use thiserror::Error;

use crate::entry::EntryId;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid {kind} name '{name}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidName {
        kind: &'static str,
        name: String,
    },

    #[error("Schema must declare at least one field")]
    EmptySchema,

    #[error("Field '{field}' is declared more than once")]
    DuplicateField {
        field: String,
    },

    #[error("Relation '{relation}' requires field '{field}'")]
    MissingField {
        relation: String,
        field: String,
    },

    #[error("Relation '{relation}' has no field '{field}'")]
    UnknownField {
        relation: String,
        field: String,
    },

    #[error("Field '{relation}.{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        relation: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Relation '{relation}' has no key field; partitioned reads need one")]
    RelationNotKeyed {
        relation: String,
    },

    #[error("Invalid cron schedule '{expression}': {reason}")]
    InvalidSchedule {
        expression: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised while registering relations and triggers.
///
/// These are fatal to application startup: no entry is ever processed
/// against a catalog that failed to build.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("Relation '{relation}' is already registered with a different schema")]
    SchemaConflict {
        relation: String,
    },

    #[error("Unknown relation: {relation}")]
    UnknownRelation {
        relation: String,
    },

    #[error("Trigger '{trigger}' is already registered")]
    DuplicateTrigger {
        trigger: String,
    },

    #[error("Unknown trigger: {trigger}")]
    UnknownTrigger {
        trigger: String,
    },

    #[error("Trigger cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        cycle: Vec<String>,
    },

    #[error("Key field '{field}' is not part of relation '{relation}'")]
    InvalidKeyField {
        relation: String,
        field: String,
    },

    #[error("Relation '{relation}' is still used by trigger '{trigger}'")]
    RelationInUse {
        relation: String,
        trigger: String,
    },

    #[error("Name '{name}' is reserved")]
    ReservedName {
        name: String,
    },
}

/// Execution errors that occur while a pipeline is running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Entry store unavailable: {message}")]
    StoreUnavailable {
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Entry not found: {id}")]
    EntryNotFound {
        id: EntryId,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Pipeline has not started; call start() first")]
    NotStarted,

    #[error("Pipeline is already running")]
    AlreadyStarted,

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl ExecutionError {
    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    pub(crate) fn disconnected(path: &str) -> Self {
        Self::Disconnected {
            path: path.to_string(),
        }
    }
}

/// Top-level error type for tributary.
#[derive(Debug, Error)]
pub enum TributaryError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TributaryError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a registration error.
    #[must_use]
    pub const fn is_registration(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::StoreUnavailable { .. }
                    | ExecutionError::Timeout { .. }
                    | ExecutionError::Disconnected { .. }
            ),
            _ => false,
        }
    }
}

impl From<StorageError> for TributaryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(message) => {
                Self::Execution(ExecutionError::StoreUnavailable { message })
            }
            StorageError::EntryNotFound(id) => Self::Execution(ExecutionError::EntryNotFound { id }),
            other => Self::Execution(ExecutionError::Storage {
                message: other.to_string(),
            }),
        }
    }
}

/// Result type alias for tributary operations.
pub type TributaryResult<T> = Result<T, TributaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detected_lists_path() {
        let err = RegistrationError::CycleDetected {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Trigger cycle detected: A -> B -> A");
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = ValidationError::TypeMismatch {
            relation: "counts".to_string(),
            field: "n".to_string(),
            expected: "int",
            actual: "string",
        };
        let msg = err.to_string();
        assert!(msg.contains("counts.n"));
        assert!(msg.contains("expects int"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::timeout(std::time::Duration::from_millis(5000));
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn test_storage_unavailable_is_retryable() {
        let err: TributaryError = StorageError::Unavailable("disk offline".into()).into();
        assert!(err.is_execution());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk offline"));
    }

    #[test]
    fn test_storage_not_found_maps_to_entry_not_found() {
        let id = EntryId::new();
        let err: TributaryError = StorageError::EntryNotFound(id).into();
        assert!(matches!(
            err,
            TributaryError::Execution(ExecutionError::EntryNotFound { id: got }) if got == id
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_registration_errors_not_retryable() {
        let err: TributaryError = RegistrationError::UnknownRelation {
            relation: "raw".into(),
        }
        .into();
        assert!(err.is_registration());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = TributaryError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
