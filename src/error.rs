use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::{local_storage::LocalStorageError, storage::StoreError},
    state::{TransitionError, game::InvalidGameId},
};

/// Errors surfaced by the round coordination core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input (estimation out of range, bad game code, invalid settings).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Ownership or host-only violation.
    #[error("permission denied for `{operation}`")]
    Permission {
        /// Operation or store path that was refused.
        operation: String,
    },
    /// The player already answered this round.
    #[error("player `{player_id}` already submitted an answer for round {round}")]
    AlreadySubmitted {
        /// Player whose answer exists.
        player_id: String,
        /// Round the answer belongs to.
        round: u32,
    },
    /// Store kept failing with transient errors until the retry budget ran out.
    #[error("store unavailable after {attempts} attempt(s)")]
    TransientStore {
        /// Attempts made before giving up.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: StoreError,
    },
    /// Referenced game or round does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A stored value could not be decoded.
    #[error("corrupt store data")]
    Corrupt(#[source] StoreError),
    /// The offline snapshot could not be persisted or loaded.
    #[error("local storage failed")]
    LocalStorage(#[from] LocalStorageError),
    /// A local phase transition did not finish in time.
    #[error("operation timed out")]
    Timeout,
}

impl CoreError {
    /// Build a permission error for the named operation.
    pub fn permission(operation: impl Into<String>) -> Self {
        CoreError::Permission {
            operation: operation.into(),
        }
    }

    /// Whether the UI should show "already submitted" instead of an error.
    pub fn is_already_submitted(&self) -> bool {
        matches!(self, CoreError::AlreadySubmitted { .. })
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PermissionDenied { path } => CoreError::Permission { operation: path },
            err @ StoreError::Decode { .. } => CoreError::Corrupt(err),
            err => CoreError::TransientStore {
                attempts: 1,
                source: err,
            },
        }
    }
}

impl From<ValidationErrors> for CoreError {
    fn from(err: ValidationErrors) -> Self {
        CoreError::Validation(err.to_string())
    }
}

impl From<InvalidGameId> for CoreError {
    fn from(err: InvalidGameId) -> Self {
        CoreError::Validation(err.to_string())
    }
}

impl From<TransitionError> for CoreError {
    fn from(err: TransitionError) -> Self {
        CoreError::InvalidState(err.to_string())
    }
}
