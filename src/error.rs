//! Error types for ssdann.

use crate::persistence::error::PersistenceError;
use thiserror::Error;

/// Errors that can occur during build and search operations.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// Out-of-range or inconsistent configuration value.
    ///
    /// Raised before any build or search work starts.
    #[error("invalid config `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    /// No shard partition fits the build memory budget.
    #[error(
        "build budget exceeded: need at least {required_bytes} bytes, budget is {budget_bytes} bytes"
    )]
    BudgetExceeded {
        required_bytes: u64,
        budget_bytes: u64,
    },

    /// Raw I/O failure (file create, positioned read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted layout is unreadable or inconsistent.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Search invoked before the index was built or loaded.
    #[error("index not ready: {0}")]
    NotReady(String),

    /// Empty index (no vectors to build from).
    #[error("index is empty")]
    EmptyIndex,

    /// Invalid parameter value outside the config surface.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Dimension mismatch between query and indexed vectors.
    #[error("dimension mismatch: query has {query_dim} dimensions, index has {doc_dim}")]
    DimensionMismatch { query_dim: usize, doc_dim: usize },
}

impl RetrieveError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    /// True for failures coming from the storage layer.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Persistence(PersistenceError::Io(_)))
    }
}

pub type Result<T> = std::result::Result<T, RetrieveError>;
