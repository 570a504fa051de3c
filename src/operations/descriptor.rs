use crate::core::{Document, Result, RunnerError};
use crate::matcher::ExpectedError;
use serde::Deserialize;
use serde_json::Value;

/// One step of a scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperationDescriptor {
    pub name: String,
    /// Id of the target entity, or `testRunner`.
    pub object: String,
    #[serde(default)]
    pub arguments: Option<Document>,
    #[serde(default)]
    pub expect_result: Option<Value>,
    #[serde(default)]
    pub expect_error: Option<ExpectedError>,
    #[serde(default)]
    pub save_result_as_entity: Option<String>,
    #[serde(default)]
    pub ignore_result_and_error: bool,
    #[serde(default)]
    pub comment: Option<Value>,
}

impl OperationDescriptor {
    pub fn new(name: &str, object: &str) -> Self {
        Self {
            name: name.to_string(),
            object: object.to_string(),
            arguments: None,
            expect_result: None,
            expect_error: None,
            save_result_as_entity: None,
            ignore_result_and_error: false,
            comment: None,
        }
    }

    pub fn arguments(mut self, arguments: Document) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|err| RunnerError::format(format!("Invalid operation {}: {}", value, err)))
    }
}

/// Parse a list of operations.
pub fn parse_operations(values: &[Value]) -> Result<Vec<OperationDescriptor>> {
    values.iter().map(OperationDescriptor::from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operation() {
        let op = OperationDescriptor::from_value(&json!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": {"document": {"_id": 1}},
            "expectResult": {"insertedId": 1}
        }))
        .unwrap();
        assert_eq!(op.name, "insertOne");
        assert!(op.expect_error.is_none());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = OperationDescriptor::from_value(&json!({"name": "x", "object": "y", "extra": 1})).unwrap_err();
        assert!(matches!(err, RunnerError::Format(_)));
    }
}
