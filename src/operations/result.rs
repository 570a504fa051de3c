use crate::core::Document;
use crate::service::results::to_document;
use crate::service::{ChangeStream, Cursor, ServiceError, ServiceResult};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Outcome of one operation: nothing, a value, a live iterator or an error.
#[derive(Clone)]
pub enum OperationResult {
    Empty,
    Value(Value),
    Cursor(Cursor),
    ChangeStream(ChangeStream),
    Error(ServiceError),
}

impl OperationResult {
    pub fn document(doc: Document) -> Self {
        OperationResult::Value(Value::Object(doc))
    }

    pub fn documents(docs: Vec<Document>) -> Self {
        OperationResult::Value(Value::Array(docs.into_iter().map(Value::Object).collect()))
    }

    /// A document, or `null` when there is none.
    pub fn optional_document(doc: Option<Document>) -> Self {
        OperationResult::Value(doc.map(Value::Object).unwrap_or(Value::Null))
    }

    pub fn serialized<T: Serialize>(result: &T) -> Self {
        Self::document(to_document(result))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, OperationResult::Empty)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OperationResult::Error(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            OperationResult::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ServiceError> {
        match self {
            OperationResult::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Empty => f.write_str("Empty"),
            OperationResult::Value(value) => write!(f, "Value({})", value),
            OperationResult::Cursor(_) => f.write_str("Cursor"),
            OperationResult::ChangeStream(_) => f.write_str("ChangeStream"),
            OperationResult::Error(err) => write!(f, "Error({})", err),
        }
    }
}

impl From<ServiceError> for OperationResult {
    fn from(err: ServiceError) -> Self {
        OperationResult::Error(err)
    }
}

/// Fold a service call into an `OperationResult`, turning failures into
/// `OperationResult::Error`.
pub trait IntoOperationResult<T> {
    fn into_result(self, on_success: impl FnOnce(T) -> OperationResult) -> OperationResult;

    fn into_empty(self) -> OperationResult
    where
        Self: Sized,
    {
        self.into_result(|_| OperationResult::Empty)
    }
}

impl<T> IntoOperationResult<T> for ServiceResult<T> {
    fn into_result(self, on_success: impl FnOnce(T) -> OperationResult) -> OperationResult {
        match self {
            Ok(value) => on_success(value),
            Err(err) => OperationResult::Error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::DeleteResult;
    use serde_json::json;

    #[test]
    fn test_service_results_fold_into_operation_results() {
        let ok: ServiceResult<DeleteResult> = Ok(DeleteResult { deleted_count: 2 });
        let result = ok.into_result(|r| OperationResult::serialized(&r));
        assert_eq!(result.value(), Some(&json!({"deletedCount": 2})));

        let failed: ServiceResult<()> = Err(ServiceError::bad_value("bad"));
        assert!(failed.into_empty().is_error());

        let empty: ServiceResult<()> = Ok(());
        assert!(empty.into_empty().is_empty());
    }

    #[test]
    fn test_missing_document_is_null() {
        assert_eq!(OperationResult::optional_document(None).value(), Some(&Value::Null));
    }
}
