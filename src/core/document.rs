use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Ordered document, the unit of storage and of every scenario argument.
pub type Document = Map<String, Value>;

/// Convert a JSON value into a document, if it is one.
pub fn into_document(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Typed accessors over a [`Document`].
pub trait DocumentExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_document(&self, key: &str) -> Option<&Document>;
    fn get_array(&self, key: &str) -> Option<&Vec<Value>>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_i64(&self, key: &str) -> Option<i64>;
    /// Resolve a dotted path (`a.b.0.c`) through nested documents and arrays.
    fn get_path(&self, path: &str) -> Option<&Value>;
}

impl DocumentExt for Document {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_object)
    }

    fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key).and_then(Value::as_array)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(value_as_i64)
    }

    fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

// ============================================================================
// Numeric helpers (plain JSON numbers and extended-JSON wrappers)
// ============================================================================

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map.iter().next()?;
            match key.as_str() {
                "$numberLong" | "$numberInt" => inner.as_str()?.parse().ok(),
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map.iter().next()?;
            match key.as_str() {
                "$numberLong" | "$numberInt" | "$numberDouble" | "$numberDecimal" => {
                    inner.as_str()?.parse().ok()
                }
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn is_numeric(value: &Value) -> bool {
    value_as_f64(value).is_some()
}

/// Build a JSON number from an `f64`, keeping integral values integral.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Type names (BSON aliases understood by `$$type` and `$type`)
// ============================================================================

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_f64() {
                "double"
            } else if n.as_i64().is_some_and(|i| i32::try_from(i).is_ok()) {
                "int"
            } else {
                "long"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) => extended_type_name(map).unwrap_or("object"),
    }
}

/// True for extended-JSON scalar wrappers such as `{"$oid": ...}`.
pub fn is_extended_json(map: &Document) -> bool {
    extended_type_name(map).is_some()
}

/// True for a non-empty document whose keys are all `$`-operators.
pub fn is_operator_document(map: &Document) -> bool {
    !map.is_empty() && !is_extended_json(map) && map.keys().all(|key| key.starts_with('$'))
}

fn extended_type_name(map: &Document) -> Option<&'static str> {
    if map.len() != 1 && !(map.len() == 2 && map.contains_key("$regularExpression")) {
        return None;
    }
    let key = map.keys().next()?;
    Some(match key.as_str() {
        "$oid" => "objectId",
        "$date" => "date",
        "$binary" | "$uuid" => "binData",
        "$numberLong" => "long",
        "$numberInt" => "int",
        "$numberDouble" => "double",
        "$numberDecimal" => "decimal",
        "$regularExpression" => "regex",
        "$timestamp" => "timestamp",
        _ => return None,
    })
}

/// Canonical ordering rank, following the server's cross-type sort order.
pub(crate) fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(map) => match extended_type_name(map) {
            Some("long" | "int" | "double" | "decimal") => 2,
            Some("binData") => 6,
            Some("objectId") => 7,
            Some("date") => 9,
            Some("timestamp") => 10,
            Some("regex") => 11,
            _ => 4,
        },
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total order over values used for sorting and range comparisons.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let (left_rank, right_rank) = (type_rank(left), type_rank(right));
    if left_rank != right_rank {
        return left_rank.cmp(&right_rank);
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ordering = compare_values(x, y);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ if left_rank == 2 => {
            let a = value_as_f64(left).unwrap_or(f64::NAN);
            let b = value_as_f64(right).unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ordering = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => Ordering::Equal,
    }
}

/// Structural equality with numeric normalisation (`1 == 1.0 == {"$numberLong": "1"}`).
/// Document key order is ignored.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if is_numeric(left) && is_numeric(right) {
        return value_as_f64(left) == value_as_f64(right);
    }
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => documents_equal(a, b),
        _ => left == right,
    }
}

pub fn documents_equal(left: &Document, right: &Document) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .all(|(key, value)| right.get(key).is_some_and(|other| values_equal(value, other)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_walks_documents_and_arrays() {
        let doc = into_document(json!({"a": {"b": [{"c": 1}, {"c": 2}]}})).unwrap();
        assert_eq!(doc.get_path("a.b.1.c"), Some(&json!(2)));
        assert_eq!(doc.get_path("a.x"), None);
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"$numberLong": "7"}), &json!(7)));
        assert!(!values_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn test_document_equality_ignores_key_order() {
        assert!(values_equal(&json!({"a": 1, "b": 2}), &json!({"b": 2, "a": 1})));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_compare_orders_by_type_then_value() {
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10.5)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(5), &json!("a")), Ordering::Less);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(&json!(1)), "int");
        assert_eq!(type_name(&json!(5_000_000_000i64)), "long");
        assert_eq!(type_name(&json!(1.5)), "double");
        assert_eq!(type_name(&json!({"$oid": "abc"})), "objectId");
        assert_eq!(type_name(&json!({"x": 1})), "object");
    }
}
