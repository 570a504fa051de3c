use crate::core::Document;
use std::collections::BTreeSet;
use std::fmt;

pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Server error codes that make a read or write retryable.
pub const RETRYABLE_CODES: &[i32] = &[
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command rejected by the server.
    Command,
    /// Write error reported inside a successful command reply.
    Write,
    InvalidArgument,
    Network,
    Timeout,
    Cancelled,
    /// Operation on a closed client, cursor or stream.
    Closed,
    GridFs,
}

/// Error raised by the backing service.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
    pub labels: BTreeSet<String>,
    pub response: Option<Document>,
    /// Result of the work completed before the failure (bulk and multi-insert writes).
    pub partial_result: Option<Document>,
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Anything that can carry server error labels.
pub trait HasErrorLabels {
    fn has_error_label(&self, label: &str) -> bool;
}

impl ServiceError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            code_name: None,
            message: message.into(),
            labels: BTreeSet::new(),
            response: None,
            partial_result: None,
        }
    }

    pub fn command(code: i32, code_name: &str, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Command, message);
        err.code = Some(code);
        err.code_name = Some(code_name.to_string());
        err
    }

    pub fn write(code: i32, code_name: &str, message: impl Into<String>) -> Self {
        let mut err = Self::command(code, code_name, message);
        err.kind = ErrorKind::Write;
        err
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::command(2, "BadValue", message)
    }

    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::write(11000, "DuplicateKey", message)
    }

    pub fn namespace_not_found(namespace: impl fmt::Display) -> Self {
        Self::command(26, "NamespaceNotFound", format!("ns not found: {}", namespace))
    }

    pub fn write_conflict() -> Self {
        Self::command(
            112,
            "WriteConflict",
            "Write conflict during plan execution and yielding is disabled.",
        )
        .with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    pub fn no_such_transaction(txn_number: i64) -> Self {
        Self::command(
            251,
            "NoSuchTransaction",
            format!("Transaction {} has been aborted.", txn_number),
        )
        .with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "The operation was cancelled.")
    }

    pub fn closed(what: &str) -> Self {
        Self::new(ErrorKind::Closed, format!("Cannot use a {} after it has been closed.", what))
    }

    pub fn gridfs(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::GridFs, message)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_response(mut self, response: Document) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_partial_result(mut self, result: Document) -> Self {
        self.partial_result = Some(result);
        self
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(self.kind, ErrorKind::Command | ErrorKind::Write)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_network(&self) -> bool {
        self.kind == ErrorKind::Network
    }

    pub fn is_retryable(&self) -> bool {
        self.is_network() || self.code.is_some_and(|code| RETRYABLE_CODES.contains(&code))
    }
}

impl HasErrorLabels for ServiceError {
    fn has_error_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.code) {
            (ErrorKind::Command | ErrorKind::Write, Some(code)) => write!(
                f,
                "Command failed with error {} ({}): '{}'",
                code,
                self.code_name.as_deref().unwrap_or("Unknown"),
                self.message
            ),
            _ => write!(f, "{:?} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ServiceError {}
