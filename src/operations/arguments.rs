use crate::core::document::value_as_i64;
use crate::core::{Document, Result, RunnerError};
use crate::entity::EntityMap;
use crate::service::ClientSession;
use serde_json::Value;

/// Argument document of one operation. Keys are checked against the
/// handler's list up front; anything else is a format error.
#[derive(Debug, Clone)]
pub struct Arguments {
    operation: String,
    doc: Document,
}

impl Arguments {
    pub fn new(operation: &str, doc: Document, allowed: &[&str]) -> Result<Self> {
        if let Some(unknown) = doc.keys().find(|key| !allowed.contains(&key.as_str())) {
            return Err(RunnerError::format(format!(
                "Unknown argument '{}' for operation '{}'",
                unknown, operation
            )));
        }
        Ok(Self {
            operation: operation.to_string(),
            doc,
        })
    }

    fn invalid(&self, key: &str, expected: &str) -> RunnerError {
        RunnerError::format(format!(
            "Argument '{}' of '{}' must be {}",
            key, self.operation, expected
        ))
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.doc.get(key).cloned()
    }

    pub fn required_value(&self, key: &str) -> Result<Value> {
        self.value(key).ok_or_else(|| {
            RunnerError::format(format!(
                "Missing required argument '{}' for operation '{}'",
                key, self.operation
            ))
        })
    }

    pub fn document(&self, key: &str) -> Result<Option<Document>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(Value::Object(doc)) => Ok(Some(doc.clone())),
            Some(_) => Err(self.invalid(key, "a document")),
        }
    }

    pub fn required_document(&self, key: &str) -> Result<Document> {
        match self.required_value(key)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(self.invalid(key, "a document")),
        }
    }

    pub fn documents(&self, key: &str) -> Result<Option<Vec<Document>>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(doc) => Ok(doc.clone()),
                    _ => Err(self.invalid(key, "an array of documents")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(self.invalid(key, "an array of documents")),
        }
    }

    pub fn required_documents(&self, key: &str) -> Result<Vec<Document>> {
        self.required_value(key)?;
        Ok(self.documents(key)?.unwrap_or_default())
    }

    pub fn string(&self, key: &str) -> Result<Option<String>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub fn required_string(&self, key: &str) -> Result<String> {
        self.required_value(key)?;
        self.string(key)?.ok_or_else(|| self.invalid(key, "a string"))
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(self.invalid(key, "a boolean")),
        }
    }

    pub fn i64(&self, key: &str) -> Result<Option<i64>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(value) => value_as_i64(value)
                .map(Some)
                .ok_or_else(|| self.invalid(key, "an integer")),
        }
    }

    pub fn required_i64(&self, key: &str) -> Result<i64> {
        self.required_value(key)?;
        self.i64(key)?.ok_or_else(|| self.invalid(key, "an integer"))
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        match self.i64(key)? {
            None => Ok(None),
            Some(n) => u64::try_from(n).map(Some).map_err(|_| self.invalid(key, "non-negative")),
        }
    }

    pub fn usize(&self, key: &str) -> Result<Option<usize>> {
        Ok(self.u64(key)?.map(|n| n as usize))
    }

    /// Resolve the `session` argument against the entity map.
    pub fn session(&self, entities: &EntityMap) -> Result<Option<ClientSession>> {
        match self.string("session")? {
            Some(id) => entities.session(&id).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value, allowed: &[&str]) -> Result<Arguments> {
        Arguments::new("op", value.as_object().cloned().unwrap(), allowed)
    }

    #[test]
    fn test_unknown_argument_names_the_key() {
        let err = args(json!({"filter": {}, "bogus": 1}), &["filter"]).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_typed_accessors() {
        let a = args(json!({"filter": {"x": 1}, "limit": 2, "upsert": true}), &["filter", "limit", "upsert"]).unwrap();
        assert_eq!(a.required_document("filter").unwrap().len(), 1);
        assert_eq!(a.i64("limit").unwrap(), Some(2));
        assert_eq!(a.bool("upsert").unwrap(), Some(true));
        assert!(a.required_document("missing").is_err());
        assert!(a.string("limit").is_err());
    }
}
