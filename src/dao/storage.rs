use std::error::Error;
use thiserror::Error;

/// Result alias for realtime store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by realtime store backends regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure that may go away on retry (network hiccup, overloaded backend).
    #[error("store unavailable: {message}")]
    Unavailable {
        /// What the backend reported.
        message: String,
        /// Underlying transport error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The operation did not complete within its deadline.
    #[error("store operation `{operation}` timed out")]
    Timeout {
        /// Name of the operation that ran out of time.
        operation: String,
    },
    /// The client is currently offline.
    #[error("store client is disconnected")]
    Disconnected,
    /// The backend access rules rejected the operation.
    #[error("permission denied at `{path}`")]
    PermissionDenied {
        /// Path the rules were evaluated for.
        path: String,
    },
    /// A stored value does not have the expected shape.
    #[error("failed to decode value at `{path}`")]
    Decode {
        /// Path the value was read from.
        path: String,
        /// Why the value did not fit.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a decode error for the value stored at `path`.
    pub fn decode(path: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Decode {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } | StoreError::Disconnected
        )
    }
}
