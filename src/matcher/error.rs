use super::value::ValueMatcher;
use crate::core::{Document, Result, RunnerError};
use crate::service::{HasErrorLabels, ServiceError};
use serde::Deserialize;
use serde_json::Value;

/// `expectError` of an operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpectedError {
    pub is_error: Option<bool>,
    pub is_client_error: Option<bool>,
    pub is_timeout_error: Option<bool>,
    pub error_contains: Option<String>,
    pub error_code: Option<i32>,
    pub error_code_name: Option<String>,
    #[serde(default)]
    pub error_labels_contain: Vec<String>,
    #[serde(default)]
    pub error_labels_omit: Vec<String>,
    pub error_response: Option<Document>,
    pub expect_result: Option<Value>,
}

impl ExpectedError {
    pub fn assert_matches(&self, actual: &ServiceError, matcher: &dyn ValueMatcher) -> Result<()> {
        let fail = |message: String| -> Result<()> {
            Err(RunnerError::assertion(format!("{} (actual error: {})", message, actual)))
        };

        if let Some(expected) = self.is_client_error {
            if actual.is_client_error() != expected {
                return fail(format!("expected isClientError = {}", expected));
            }
        }
        if let Some(expected) = self.is_timeout_error {
            if actual.is_timeout() != expected {
                return fail(format!("expected isTimeoutError = {}", expected));
            }
        }
        if let Some(fragment) = &self.error_contains {
            if !actual.to_string().to_lowercase().contains(&fragment.to_lowercase()) {
                return fail(format!("expected the message to contain '{}'", fragment));
            }
        }
        if let Some(code) = self.error_code {
            if actual.code != Some(code) {
                return fail(format!("expected error code {}", code));
            }
        }
        if let Some(code_name) = &self.error_code_name {
            if actual.code_name.as_deref() != Some(code_name.as_str()) {
                return fail(format!("expected error code name '{}'", code_name));
            }
        }
        for label in &self.error_labels_contain {
            if !actual.has_error_label(label) {
                return fail(format!("expected error label '{}'", label));
            }
        }
        for label in &self.error_labels_omit {
            if actual.has_error_label(label) {
                return fail(format!("unexpected error label '{}'", label));
            }
        }
        if let Some(response) = &self.error_response {
            let actual_response = actual.response.clone().map(Value::Object);
            let expected = Value::Object(response.clone());
            matcher.assert_values_match(actual_response.as_ref(), &expected)?;
        }
        if let Some(expected) = &self.expect_result {
            let partial = actual.partial_result.clone().map(Value::Object);
            matcher.assert_values_match(partial.as_ref(), expected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::UnifiedValueMatcher;
    use crate::service::error::TRANSIENT_TRANSACTION_ERROR;
    use serde_json::json;

    fn expected(value: Value) -> ExpectedError {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_code_and_labels() {
        let matcher = UnifiedValueMatcher::new();
        let err = ServiceError::write_conflict();
        expected(json!({"errorCode": 112, "errorCodeName": "WriteConflict", "isClientError": false}))
            .assert_matches(&err, &matcher)
            .unwrap();
        expected(json!({"errorLabelsContain": [TRANSIENT_TRANSACTION_ERROR]}))
            .assert_matches(&err, &matcher)
            .unwrap();
        assert!(
            expected(json!({"errorLabelsOmit": [TRANSIENT_TRANSACTION_ERROR]}))
                .assert_matches(&err, &matcher)
                .unwrap_err()
                .is_assertion()
        );
    }

    #[test]
    fn test_error_contains_is_case_insensitive() {
        let matcher = UnifiedValueMatcher::new();
        let err = ServiceError::gridfs("File not found for id 1");
        expected(json!({"errorContains": "FILE NOT FOUND", "isClientError": true}))
            .assert_matches(&err, &matcher)
            .unwrap();
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(serde_json::from_value::<ExpectedError>(json!({"errorKind": 1})).is_err());
    }

    #[test]
    fn test_expect_result_matches_partial_result() {
        let matcher = UnifiedValueMatcher::new();
        let partial = json!({"insertedCount": 1}).as_object().cloned().unwrap();
        let err = ServiceError::duplicate_key("dup").with_partial_result(partial);
        expected(json!({"expectResult": {"insertedCount": 1}}))
            .assert_matches(&err, &matcher)
            .unwrap();
    }
}
