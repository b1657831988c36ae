use thiserror::Error;

use crate::exercise::CatalogError;
use crate::session::BenchmarkSession;

/// Failure reported by a model provider.
///
/// `Transient` faults are expected to be retried by the transport itself; one
/// that reaches the engine has already exhausted that budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("transient model error: {0}")]
    Transient(String),

    #[error("fatal model error: {0}")]
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Model communication error: {0}")]
    Model(#[from] ModelError),

    #[error("Session aborted after {} finished exercises: {reason}", .partial.results.len())]
    SessionAborted {
        reason: String,
        partial: Box<BenchmarkSession>,
    },

    #[error("Exercise catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    pub fn config(msg: impl Into<String>) -> Self {
        BenchError::Configuration(msg.into())
    }

    /// The partial session carried by an aborted run, if any.
    pub fn partial_session(&self) -> Option<&BenchmarkSession> {
        match self {
            BenchError::SessionAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
