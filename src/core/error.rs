use crate::service::{HasErrorLabels, ServiceError};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("No {kind} entity with id '{id}'")]
    EntityNotFound { kind: &'static str, id: String },

    #[error("Entity with id '{0}' already exists")]
    EntityExists(String),

    #[error("Entity map has already been disposed")]
    Disposed,

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("Unexpected service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl RunnerError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            kind,
            id: id.into(),
        }
    }

    /// Domain assertion mismatch, as opposed to an unexpected error.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Assertion(_))
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl<T> From<std::sync::PoisonError<T>> for RunnerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl HasErrorLabels for RunnerError {
    fn has_error_label(&self, label: &str) -> bool {
        match self {
            Self::Service(err) => err.has_error_label(label),
            _ => false,
        }
    }
}
