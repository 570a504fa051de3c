// ============================================================================
// Value Matcher
// ============================================================================
//
// Matching rules:
//
//   - root documents (the expected value itself, and documents directly in a
//     root array) may carry extra actual keys; nested documents may not
//   - numbers compare numerically across int, long and double
//   - `$$`-operators replace a value with a predicate
//
// ============================================================================

use super::error::ExpectedError;
use crate::core::document::{is_extended_json, is_numeric, type_name, value_as_f64};
use crate::core::{Result, RunnerError, values_equal};
use crate::entity::EntityMap;
use crate::service::ServiceError;
use crate::service::gridfs::binary_bytes;
use serde_json::Value;
use std::sync::Arc;

/// Compares observed values against expectations from a scenario file.
pub trait ValueMatcher: Send + Sync {
    /// `actual` is `None` when the value is absent.
    fn assert_values_match(&self, actual: Option<&Value>, expected: &Value) -> Result<()>;

    fn assert_errors_match(&self, actual: &ServiceError, expected: &ExpectedError) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct UnifiedValueMatcher {
    entities: Option<Arc<EntityMap>>,
}

fn mismatch(path: &str, message: impl std::fmt::Display) -> RunnerError {
    let at = if path.is_empty() { "root" } else { path };
    RunnerError::assertion(format!("at {}: {}", at, message))
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// The operator name and operand of a `{"$$op": operand}` document.
fn special_operator(expected: &Value) -> Option<(&str, &Value)> {
    let map = expected.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, operand) = map.iter().next()?;
    key.starts_with("$$").then_some((key.as_str(), operand))
}

fn type_matches(actual: &Value, alias: &str) -> bool {
    let actual_type = type_name(actual);
    match alias {
        "number" => is_numeric(actual),
        // JSON integers carry no width, so a `long` expectation accepts any integer.
        "long" => matches!(actual_type, "int" | "long"),
        "bool" | "boolean" => actual_type == "bool",
        other => actual_type == other,
    }
}

impl UnifiedValueMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Arc<EntityMap>) -> Self {
        Self {
            entities: Some(entities),
        }
    }

    fn entities(&self) -> Result<&EntityMap> {
        self.entities
            .as_deref()
            .ok_or_else(|| RunnerError::InvalidState("Matcher has no entity map".to_string()))
    }

    fn match_value(
        &self,
        actual: Option<&Value>,
        expected: &Value,
        path: &str,
        root: bool,
    ) -> Result<()> {
        if let Some((operator, operand)) = special_operator(expected) {
            return self.match_operator(actual, operator, operand, path, root);
        }
        let Some(actual) = actual else {
            return Err(mismatch(path, format!("expected {} but the value is absent", expected)));
        };

        match expected {
            Value::Object(expected_doc) if !is_extended_json(expected_doc) => {
                let Some(actual_doc) = actual.as_object() else {
                    return Err(mismatch(path, format!("expected a document, got {}", actual)));
                };
                for (key, expected_field) in expected_doc {
                    let field_path = child(path, key);
                    self.match_value(actual_doc.get(key), expected_field, &field_path, false)?;
                }
                if !root {
                    let extra = actual_doc.keys().find(|key| !expected_doc.contains_key(*key));
                    if let Some(extra) = extra {
                        return Err(mismatch(path, format!("unexpected field '{}'", extra)));
                    }
                }
                Ok(())
            }
            Value::Array(expected_items) => {
                let Some(actual_items) = actual.as_array() else {
                    return Err(mismatch(path, format!("expected an array, got {}", actual)));
                };
                if actual_items.len() != expected_items.len() {
                    return Err(mismatch(
                        path,
                        format!(
                            "expected {} elements, got {}",
                            expected_items.len(),
                            actual_items.len()
                        ),
                    ));
                }
                let pairs = actual_items.iter().zip(expected_items).enumerate();
                for (i, (actual_item, expected_item)) in pairs {
                    let item_path = child(path, &i.to_string());
                    self.match_value(Some(actual_item), expected_item, &item_path, root)?;
                }
                Ok(())
            }
            _ if is_numeric(expected) => {
                if is_numeric(actual) && value_as_f64(actual) == value_as_f64(expected) {
                    Ok(())
                } else {
                    Err(mismatch(path, format!("expected {}, got {}", expected, actual)))
                }
            }
            _ if values_equal(actual, expected) => Ok(()),
            _ => Err(mismatch(path, format!("expected {}, got {}", expected, actual))),
        }
    }

    fn match_operator(
        &self,
        actual: Option<&Value>,
        operator: &str,
        operand: &Value,
        path: &str,
        root: bool,
    ) -> Result<()> {
        match operator {
            "$$exists" => {
                let should_exist = operand
                    .as_bool()
                    .ok_or_else(|| RunnerError::format("$$exists takes a boolean"))?;
                if actual.is_some() == should_exist {
                    Ok(())
                } else if should_exist {
                    Err(mismatch(path, "expected the value to exist"))
                } else {
                    Err(mismatch(path, "expected the value to be absent"))
                }
            }
            "$$type" => {
                let actual = actual.ok_or_else(|| mismatch(path, "expected a value for $$type"))?;
                let aliases: Vec<&str> = match operand {
                    Value::String(alias) => vec![alias.as_str()],
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    _ => return Err(RunnerError::format("$$type takes a string or an array")),
                };
                if aliases.iter().any(|alias| type_matches(actual, alias)) {
                    Ok(())
                } else {
                    Err(mismatch(
                        path,
                        format!("expected type {:?}, got {}", aliases, type_name(actual)),
                    ))
                }
            }
            "$$unsetOrMatches" => match actual {
                None => Ok(()),
                Some(actual) => self.match_value(Some(actual), operand, path, root),
            },
            "$$matchesEntity" => {
                let id = operand
                    .as_str()
                    .ok_or_else(|| RunnerError::format("$$matchesEntity takes an entity id"))?;
                let entity = self.entities()?.result(id)?;
                self.match_value(actual, &entity, path, root)
            }
            "$$matchesHexBytes" => {
                let hex_text = operand
                    .as_str()
                    .ok_or_else(|| RunnerError::format("$$matchesHexBytes takes a hex string"))?;
                let expected = hex::decode(hex_text)
                    .map_err(|err| RunnerError::format(format!("Invalid hex bytes: {}", err)))?;
                match actual.and_then(binary_bytes) {
                    Some(bytes) if bytes == expected => Ok(()),
                    _ => Err(mismatch(path, format!("expected bytes {}", hex_text))),
                }
            }
            "$$sessionLsid" => {
                let id = operand
                    .as_str()
                    .ok_or_else(|| RunnerError::format("$$sessionLsid takes a session id"))?;
                let lsid = Value::Object(self.entities()?.session_lsid(id)?);
                match actual {
                    Some(actual) if values_equal(actual, &lsid) => Ok(()),
                    _ => Err(mismatch(path, format!("expected the lsid of session '{}'", id))),
                }
            }
            "$$lte" => {
                let limit = value_as_f64(operand)
                    .ok_or_else(|| RunnerError::format("$$lte takes a number"))?;
                match actual.and_then(value_as_f64) {
                    Some(value) if value <= limit => Ok(()),
                    _ => Err(mismatch(path, format!("expected a number <= {}", operand))),
                }
            }
            "$$matchAsDocument" => {
                let text = actual
                    .and_then(Value::as_str)
                    .ok_or_else(|| mismatch(path, "expected a JSON string for $$matchAsDocument"))?;
                let parsed: Value = serde_json::from_str(text)
                    .map_err(|err| {
                        mismatch(path, format!("value is not a JSON document: {}", err))
                    })?;
                self.match_value(Some(&parsed), operand, path, false)
            }
            "$$matchAsRoot" => self.match_value(actual, operand, path, true),
            other => Err(RunnerError::format(format!("Unknown special operator '{}'", other))),
        }
    }
}

impl ValueMatcher for UnifiedValueMatcher {
    fn assert_values_match(&self, actual: Option<&Value>, expected: &Value) -> Result<()> {
        self.match_value(actual, expected, "", true)
    }

    fn assert_errors_match(&self, actual: &ServiceError, expected: &ExpectedError) -> Result<()> {
        expected.assert_matches(actual, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(actual: Value, expected: Value) -> Result<()> {
        UnifiedValueMatcher::new().assert_values_match(Some(&actual), &expected)
    }

    #[test]
    fn test_root_documents_allow_extra_keys() {
        assert!(check(json!({"a": 1, "b": 2}), json!({"a": 1})).is_ok());
        assert!(check(json!([{"a": 1, "x": 0}]), json!([{"a": 1}])).is_ok());
        let err = check(json!({"a": {"b": 1, "c": 2}}), json!({"a": {"b": 1}})).unwrap_err();
        assert!(err.is_assertion());
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert!(check(json!({"n": 1.0}), json!({"n": 1})).is_ok());
        assert!(check(json!({"n": {"$numberLong": "3"}}), json!({"n": 3})).is_ok());
        assert!(check(json!({"n": 2}), json!({"n": 3})).is_err());
    }

    #[test]
    fn test_special_operators() {
        assert!(check(json!({}), json!({"a": {"$$exists": false}})).is_ok());
        assert!(check(json!({"a": 1}), json!({"a": {"$$exists": true}})).is_ok());
        assert!(check(json!({"a": 1}), json!({"a": {"$$type": ["int", "long"]}})).is_ok());
        assert!(check(json!({"a": "x"}), json!({"a": {"$$type": "int"}})).is_err());
        assert!(check(json!({}), json!({"a": {"$$unsetOrMatches": 1}})).is_ok());
        assert!(check(json!({"a": 2}), json!({"a": {"$$unsetOrMatches": 1}})).is_err());
        assert!(check(json!({"a": 5}), json!({"a": {"$$lte": 5}})).is_ok());
        assert!(check(json!({"a": "{\"x\": 1}"}), json!({"a": {"$$matchAsDocument": {"x": 1}}})).is_ok());
        assert!(check(json!({"a": {"b": 1, "c": 2}}), json!({"a": {"$$matchAsRoot": {"b": 1}}})).is_ok());
        let bytes = json!({"$binary": {"base64": "ESIz", "subType": "00"}});
        assert!(check(json!({"a": bytes}), json!({"a": {"$$matchesHexBytes": "112233"}})).is_ok());
    }

    #[test]
    fn test_unknown_operator_is_a_format_error() {
        let err = check(json!({"a": 1}), json!({"a": {"$$bogus": 1}})).unwrap_err();
        assert!(matches!(err, RunnerError::Format(_)));
    }

    #[test]
    fn test_array_length_must_match() {
        assert!(check(json!([1, 2]), json!([1])).is_err());
        assert!(check(json!([]), json!([])).is_ok());
    }
}
