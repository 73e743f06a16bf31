//! Error types for the Insight Kubernetes operator.

use thiserror::Error;

/// Errors surfaced by a [`crate::store::ResourceStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency failure: the stored object changed since it was
    /// read, or a create raced with another writer.
    #[error("write conflict on {kind}/{name}: stored version is newer")]
    Conflict {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Kubernetes API error other than a conflict.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The store cannot serve this kind in this cluster.
    #[error("store cannot serve {0} in this cluster")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this error is a recoverable write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Resource store failure; the framework retries the pass with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed declaration; requires an edit, never retried automatically.
    #[error("invalid declaration: {0}")]
    Validation(String),

    /// The declaration is missing a namespace.
    #[error("declaration {name} must be namespaced")]
    MissingNamespace {
        /// Declaration name.
        name: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::Store(StoreError::Kube(err))
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
