// ============================================================================
// Query Engine
// ============================================================================
//
// Filter matching, update application, projection, sorting and the small
// aggregation pipeline the in-memory deployment understands.
//
// ============================================================================

use super::error::{ServiceError, ServiceResult};
use crate::core::document::{
    Document, compare_values, is_operator_document, number_value, type_rank, value_as_f64,
    value_as_i64, values_equal,
};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const REGEX_CACHE_LIMIT: usize = 200;

lazy_static::lazy_static! {
    static ref REGEX_CACHE: Mutex<HashMap<(String, String), Arc<Regex>>> =
        Mutex::new(HashMap::new());
}

/// Compile `pattern` with `$options` flags, reusing earlier compilations.
fn compiled_regex(pattern: &str, options: &str) -> ServiceResult<Arc<Regex>> {
    let key = (pattern.to_string(), options.to_string());
    if let Some(regex) = REGEX_CACHE.lock().ok().and_then(|cache| cache.get(&key).cloned()) {
        return Ok(regex);
    }
    let regex = Arc::new(
        RegexBuilder::new(pattern)
            .case_insensitive(options.contains('i'))
            .multi_line(options.contains('m'))
            .dot_matches_new_line(options.contains('s'))
            .ignore_whitespace(options.contains('x'))
            .build()
            .map_err(|err| ServiceError::bad_value(format!("invalid regex: {}", err)))?,
    );
    if let Ok(mut cache) = REGEX_CACHE.lock() {
        if cache.len() >= REGEX_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key, regex.clone());
    }
    Ok(regex)
}

// ============================================================================
// Path helpers
// ============================================================================

/// Collect every value reachable by `path`, descending into arrays of documents.
fn collect_values<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_values(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect_values(child, rest, out);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                collect_values(item, segments, out);
            }
        }
        _ => {}
    }
}

fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*head) {
            collect_values(value, rest, &mut out);
        }
    }
    out
}

fn path_not_viable(path: &str) -> ServiceError {
    ServiceError::command(
        28,
        "PathNotViable",
        format!("Cannot create field along path '{}'", path),
    )
}

pub fn set_path(doc: &mut Document, path: &str, value: Value) -> ServiceResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(path_not_viable(path));
    };

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => return Err(path_not_viable(path)),
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

pub fn unset_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.shift_remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(child)) => unset_path(child, rest),
            _ => None,
        },
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    match path.split_once('.') {
        None => doc.get_mut(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(child)) => get_path_mut(child, rest),
            _ => None,
        },
    }
}

// ============================================================================
// Filters
// ============================================================================

pub fn matches_filter(doc: &Document, filter: &Document) -> ServiceResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_filter(doc, clause))
                .collect::<ServiceResult<Vec<bool>>>()?
                .into_iter()
                .all(|m| m),
            "$or" => logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_filter(doc, clause))
                .collect::<ServiceResult<Vec<bool>>>()?
                .into_iter()
                .any(|m| m),
            "$nor" => !logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_filter(doc, clause))
                .collect::<ServiceResult<Vec<bool>>>()?
                .into_iter()
                .any(|m| m),
            op if op.starts_with('$') => {
                return Err(ServiceError::bad_value(format!(
                    "unknown top level operator: {}",
                    op
                )));
            }
            path => matches_condition(&resolve(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_clauses<'a>(op: &str, value: &'a Value) -> ServiceResult<Vec<&'a Document>> {
    let items = value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ServiceError::bad_value(format!("{} must be a nonempty array", op)))?;
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                ServiceError::bad_value(format!("{} argument's entries must be objects", op))
            })
        })
        .collect()
}

fn matches_condition(candidates: &[&Value], condition: &Value) -> ServiceResult<bool> {
    match condition {
        Value::Object(ops) if is_operator_document(ops) => {
            for (op, operand) in ops {
                if op == "$options" {
                    continue;
                }
                if !apply_operator(candidates, op, operand, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_any(candidates, condition)),
    }
}

fn equals_any(candidates: &[&Value], expected: &Value) -> bool {
    if candidates.is_empty() {
        return expected.is_null();
    }
    candidates.iter().any(|candidate| {
        values_equal(candidate, expected)
            || candidate
                .as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(item, expected)))
    })
}

fn compares(candidates: &[&Value], operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    let check = |value: &Value| {
        type_rank(value) == type_rank(operand) && accept(compare_values(value, operand))
    };
    candidates.iter().any(|candidate| match candidate {
        Value::Array(items) => check(candidate) || items.iter().any(check),
        _ => check(candidate),
    })
}

fn apply_operator(
    candidates: &[&Value],
    op: &str,
    operand: &Value,
    siblings: &Document,
) -> ServiceResult<bool> {
    Ok(match op {
        "$eq" => equals_any(candidates, operand),
        "$ne" => !equals_any(candidates, operand),
        "$gt" => compares(candidates, operand, |o| o == Ordering::Greater),
        "$gte" => compares(candidates, operand, |o| o != Ordering::Less),
        "$lt" => compares(candidates, operand, |o| o == Ordering::Less),
        "$lte" => compares(candidates, operand, |o| o != Ordering::Greater),
        "$in" | "$nin" => {
            let options = operand
                .as_array()
                .ok_or_else(|| ServiceError::bad_value(format!("{} needs an array", op)))?;
            let found = options.iter().any(|option| equals_any(candidates, option));
            if op == "$in" { found } else { !found }
        }
        "$exists" => {
            let wanted = operand.as_bool().unwrap_or_else(|| {
                value_as_f64(operand).is_some_and(|n| n != 0.0)
            });
            candidates.is_empty() != wanted
        }
        "$size" => {
            let size = value_as_i64(operand)
                .ok_or_else(|| ServiceError::bad_value("$size needs a number"))?;
            candidates
                .iter()
                .any(|candidate| candidate.as_array().is_some_and(|a| a.len() as i64 == size))
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| ServiceError::bad_value("$regex has to be a string"))?;
            let options = siblings.get("$options").and_then(Value::as_str).unwrap_or("");
            let regex = compiled_regex(pattern, options)?;
            candidates
                .iter()
                .any(|candidate| candidate.as_str().is_some_and(|s| regex.is_match(s)))
        }
        "$not" => !matches_condition(candidates, operand)?,
        other => {
            return Err(ServiceError::bad_value(format!("unknown operator: {}", other)));
        }
    })
}

// ============================================================================
// Updates
// ============================================================================

/// Shape of an update argument.
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Operators(Document),
    Pipeline(Vec<Document>),
    Replacement(Document),
}

impl UpdateSpec {
    pub fn from_update(value: &Value) -> ServiceResult<Self> {
        match value {
            Value::Object(doc) if is_operator_document(doc) => Ok(Self::Operators(doc.clone())),
            Value::Object(_) => Err(ServiceError::invalid_argument(
                "Update document must contain only update operators.",
            )),
            Value::Array(stages) => stages
                .iter()
                .map(|stage| {
                    stage.as_object().cloned().ok_or_else(|| {
                        ServiceError::bad_value("update pipeline stages must be documents")
                    })
                })
                .collect::<ServiceResult<Vec<_>>>()
                .map(Self::Pipeline),
            _ => Err(ServiceError::invalid_argument(
                "Update must be a document or a pipeline.",
            )),
        }
    }

    pub fn from_replacement(doc: &Document) -> ServiceResult<Self> {
        if doc.keys().any(|key| key.starts_with('$')) {
            return Err(ServiceError::invalid_argument(
                "Replacement document must not contain update operators.",
            ));
        }
        Ok(Self::Replacement(doc.clone()))
    }
}

/// Apply an update to `doc`; `inserting` enables `$setOnInsert`.
pub fn apply_update(doc: &Document, spec: &UpdateSpec, inserting: bool) -> ServiceResult<Document> {
    match spec {
        UpdateSpec::Replacement(replacement) => {
            let mut result = Document::new();
            if let Some(id) = doc.get("_id") {
                result.insert("_id".to_string(), id.clone());
            }
            for (key, value) in replacement {
                if key != "_id" || !result.contains_key("_id") {
                    result.insert(key.clone(), value.clone());
                }
            }
            Ok(result)
        }
        UpdateSpec::Pipeline(stages) => {
            let mut result = doc.clone();
            for stage in stages {
                result = apply_document_stage(result, stage)?;
            }
            Ok(result)
        }
        UpdateSpec::Operators(operators) => {
            let mut result = doc.clone();
            for (op, fields) in operators {
                let fields = fields.as_object().ok_or_else(|| {
                    let message = format!("Modifiers operate on fields but found {}", fields);
                    ServiceError::bad_value(message)
                })?;
                for (path, operand) in fields {
                    apply_field_operator(&mut result, op, path, operand, inserting)?;
                }
            }
            Ok(result)
        }
    }
}

fn apply_field_operator(
    doc: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
    inserting: bool,
) -> ServiceResult<()> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            unset_path(doc, path);
            Ok(())
        }
        "$inc" => {
            if value_as_f64(operand).is_none() {
                return Err(ServiceError::command(
                    14,
                    "TypeMismatch",
                    format!(
                        "Cannot increment with non-numeric argument: {{{}: {}}}",
                        path, operand
                    ),
                ));
            }
            let updated = match get_path_mut(doc, path) {
                Some(current) => add_numbers(current, operand).ok_or_else(|| {
                    ServiceError::command(
                        14,
                        "TypeMismatch",
                        format!("Cannot apply $inc to a value of non-numeric type at '{}'", path),
                    )
                })?,
                None => operand.clone(),
            };
            set_path(doc, path, updated)
        }
        "$min" | "$max" => {
            let replace = match get_path_mut(doc, path) {
                Some(current) => {
                    let ordering = compare_values(operand, current);
                    (op == "$min" && ordering == Ordering::Less)
                        || (op == "$max" && ordering == Ordering::Greater)
                }
                None => true,
            };
            if replace {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$push" | "$addToSet" => {
            let items = match operand {
                Value::Object(spec) if spec.contains_key("$each") => spec
                    .get("$each")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| ServiceError::bad_value("$each requires an array"))?,
                other => vec![other.clone()],
            };
            let mut array = match get_path_mut(doc, path) {
                Some(Value::Array(existing)) => existing.clone(),
                Some(_) => {
                    return Err(ServiceError::bad_value(format!(
                        "The field '{}' must be an array",
                        path
                    )));
                }
                None => Vec::new(),
            };
            for item in items {
                if op == "$push" || !array.iter().any(|existing| values_equal(existing, &item)) {
                    array.push(item);
                }
            }
            set_path(doc, path, Value::Array(array))
        }
        "$pull" => {
            if let Some(Value::Array(existing)) = get_path_mut(doc, path) {
                existing.retain(|item| !values_equal(item, operand));
            }
            Ok(())
        }
        "$rename" => {
            let target = operand
                .as_str()
                .ok_or_else(|| ServiceError::bad_value("$rename target must be a string"))?;
            if let Some(value) = unset_path(doc, path) {
                set_path(doc, target, value)?;
            }
            Ok(())
        }
        other => Err(ServiceError::bad_value(format!(
            "Unknown modifier: {}. Expected a valid update modifier or pipeline-style update",
            other
        ))),
    }
}

fn add_numbers(current: &Value, delta: &Value) -> Option<Value> {
    match (current, delta) {
        (Value::Number(a), Value::Number(b)) if a.is_i64() && b.is_i64() => {
            Some(Value::from(a.as_i64()?.checked_add(b.as_i64()?)?))
        }
        _ => Some(number_value(value_as_f64(current)? + value_as_f64(delta)?)),
    }
}

// ============================================================================
// Expressions, projection, sort
// ============================================================================

/// Evaluate an aggregation expression against `doc`.
pub fn evaluate(doc: &Document, expr: &Value) -> ServiceResult<Value> {
    match expr {
        Value::String(s) if s == "$$ROOT" => Ok(Value::Object(doc.clone())),
        Value::String(s) if s.starts_with("$$") => Err(ServiceError::bad_value(format!(
            "Use of undefined variable: {}",
            &s[2..]
        ))),
        Value::String(s) if s.starts_with('$') => Ok(resolve(doc, &s[1..])
            .first()
            .map(|value| (*value).clone())
            .unwrap_or(Value::Null)),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(doc, item))
            .collect::<ServiceResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) if map.len() == 1 && is_operator_document(map) => {
            let (op, operand) = map
                .iter()
                .next()
                .ok_or_else(|| ServiceError::bad_value("empty expression"))?;
            evaluate_operator(doc, op, operand)
        }
        Value::Object(map) => {
            let mut out = Document::new();
            for (key, value) in map {
                out.insert(key.clone(), evaluate(doc, value)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn evaluate_operator(doc: &Document, op: &str, operand: &Value) -> ServiceResult<Value> {
    let args = || -> ServiceResult<Vec<Value>> {
        match operand {
            Value::Array(items) => items.iter().map(|item| evaluate(doc, item)).collect(),
            single => Ok(vec![evaluate(doc, single)?]),
        }
    };
    match op {
        "$literal" => Ok(operand.clone()),
        "$concat" => {
            let mut out = String::new();
            for part in args()? {
                match part {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => return Ok(Value::Null),
                    other => {
                        return Err(ServiceError::bad_value(format!(
                            "$concat only supports strings, not {}",
                            other
                        )));
                    }
                }
            }
            Ok(Value::String(out))
        }
        "$add" => {
            let mut total = Value::from(0);
            for part in args()? {
                total = add_numbers(&total, &part)
                    .ok_or_else(|| ServiceError::bad_value("$add only supports numeric types"))?;
            }
            Ok(total)
        }
        "$size" => match args()?.as_slice() {
            [Value::Array(items)] => Ok(Value::from(items.len() as i64)),
            _ => Err(ServiceError::bad_value("The argument to $size must be an array")),
        },
        other => Err(ServiceError::command(
            168,
            "InvalidPipelineOperator",
            format!("Unrecognized expression '{}'", other),
        )),
    }
}

fn is_truthy_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        other => value_as_f64(other).map(|n| n != 0.0),
    }
}

pub fn project(doc: &Document, projection: &Document) -> ServiceResult<Document> {
    let mut inclusion = None;
    for (key, value) in projection {
        if key == "_id" {
            continue;
        }
        let include = is_truthy_flag(value).unwrap_or(true);
        match inclusion {
            None => inclusion = Some(include),
            Some(mode) if mode != include => {
                return Err(ServiceError::command(
                    31254,
                    "Location31254",
                    format!("Cannot do exclusion on field {} in inclusion projection", key),
                ));
            }
            _ => {}
        }
    }

    let exclude_id = projection
        .get("_id")
        .and_then(is_truthy_flag)
        .is_some_and(|flag| !flag);

    if inclusion.unwrap_or(false) {
        let mut out = Document::new();
        if !exclude_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (path, value) in projection {
            if path == "_id" {
                continue;
            }
            match is_truthy_flag(value) {
                Some(_) => {
                    if let Some(found) = resolve(doc, path).first() {
                        set_path(&mut out, path, (*found).clone())?;
                    }
                }
                None => set_path(&mut out, path, evaluate(doc, value)?)?,
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for (path, _) in projection.iter().filter(|(key, _)| key.as_str() != "_id") {
            unset_path(&mut out, path);
        }
        if exclude_id {
            out.shift_remove("_id");
        }
        Ok(out)
    }
}

pub fn sort_documents(docs: &mut [Document], sort: &Document) {
    let null = Value::Null;
    docs.sort_by(|left, right| {
        for (path, direction) in sort {
            let a = resolve(left, path).first().copied().unwrap_or(&null);
            let b = resolve(right, path).first().copied().unwrap_or(&null);
            let mut ordering = compare_values(a, b);
            if value_as_i64(direction).is_some_and(|d| d < 0) {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

// ============================================================================
// Aggregation
// ============================================================================

fn single_stage(stage: &Document) -> ServiceResult<(&String, &Value)> {
    if stage.len() != 1 {
        return Err(ServiceError::command(
            40323,
            "Location40323",
            "A pipeline stage specification object must contain exactly one field.",
        ));
    }
    stage
        .iter()
        .next()
        .ok_or_else(|| ServiceError::bad_value("empty pipeline stage"))
}

fn stage_document<'a>(name: &str, spec: &'a Value) -> ServiceResult<&'a Document> {
    spec.as_object().ok_or_else(|| {
        ServiceError::bad_value(format!("{} specification must be an object", name))
    })
}

/// Stages that transform one document at a time (`$set`, `$addFields`, `$unset`, `$project`).
fn apply_document_stage(doc: Document, stage: &Document) -> ServiceResult<Document> {
    let (name, spec) = single_stage(stage)?;
    match name.as_str() {
        "$set" | "$addFields" => {
            let mut out = doc.clone();
            for (path, expr) in stage_document(name, spec)? {
                set_path(&mut out, path, evaluate(&doc, expr)?)?;
            }
            Ok(out)
        }
        "$unset" => {
            let mut out = doc;
            let fields: Vec<&str> = match spec {
                Value::String(field) => vec![field.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => {
                    return Err(ServiceError::bad_value(
                        "$unset specification must be a string or array",
                    ));
                }
            };
            for field in fields {
                unset_path(&mut out, field);
            }
            Ok(out)
        }
        "$project" => project(&doc, stage_document(name, spec)?),
        other => Err(ServiceError::command(
            40324,
            "Location40324",
            format!("Unrecognized pipeline stage name: '{}'", other),
        )),
    }
}

pub fn run_pipeline(
    mut docs: Vec<Document>,
    pipeline: &[Document],
) -> ServiceResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = single_stage(stage)?;
        docs = match name.as_str() {
            "$match" => {
                let filter = stage_document(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches_filter(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                sort_documents(&mut docs, stage_document(name, spec)?);
                docs
            }
            "$skip" => {
                let n = value_as_i64(spec).filter(|n| *n >= 0).ok_or_else(|| {
                    ServiceError::bad_value("$skip must be a non-negative number")
                })?;
                docs.into_iter().skip(n as usize).collect()
            }
            "$limit" => {
                let n = value_as_i64(spec).filter(|n| *n > 0).ok_or_else(|| {
                    ServiceError::bad_value("the limit must be positive")
                })?;
                docs.into_iter().take(n as usize).collect()
            }
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|field| !field.is_empty())
                    .ok_or_else(|| {
                        ServiceError::bad_value("the count field must be a non-empty string")
                    })?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.to_string(), Value::from(docs.len() as i64));
                    vec![out]
                }
            }
            _ => docs
                .into_iter()
                .map(|doc| apply_document_stage(doc, stage))
                .collect::<ServiceResult<Vec<_>>>()?,
        };
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::into_document;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_filter_operators() {
        let d = doc(json!({"_id": 1, "x": 5, "tags": ["a", "b"], "sub": {"y": "hello"}}));
        assert!(matches_filter(&d, &doc(json!({"x": {"$gt": 4, "$lte": 5}}))).unwrap());
        assert!(matches_filter(&d, &doc(json!({"tags": "a"}))).unwrap());
        assert!(matches_filter(&d, &doc(json!({"sub.y": {"$regex": "^HE", "$options": "i"}}))).unwrap());
        assert!(matches_filter(&d, &doc(json!({"missing": {"$exists": false}}))).unwrap());
        assert!(matches_filter(&d, &doc(json!({"$or": [{"x": 1}, {"x": 5}]}))).unwrap());
        assert!(!matches_filter(&d, &doc(json!({"x": {"$in": [1, 2]}}))).unwrap());
        assert!(!matches_filter(&d, &doc(json!({"x": {"$gt": "a"}}))).unwrap());
    }

    #[test]
    fn test_unknown_filter_operator_is_bad_value() {
        let d = doc(json!({"x": 1}));
        let err = matches_filter(&d, &doc(json!({"x": {"$bogus": 1}}))).unwrap_err();
        assert_eq!(err.code, Some(2));
    }

    #[test]
    fn test_update_operators() {
        let d = doc(json!({"_id": 1, "n": 1, "list": [1]}));
        let spec = UpdateSpec::from_update(&json!({
            "$inc": {"n": 2},
            "$push": {"list": {"$each": [2, 3]}},
            "$set": {"a.b": true}
        }))
        .unwrap();
        let updated = apply_update(&d, &spec, false).unwrap();
        assert_eq!(Value::Object(updated), json!({"_id": 1, "n": 3, "list": [1, 2, 3], "a": {"b": true}}));
    }

    #[test]
    fn test_replacement_keeps_id() {
        let d = doc(json!({"_id": 7, "x": 1}));
        let spec = UpdateSpec::from_replacement(&doc(json!({"y": 2}))).unwrap();
        let replaced = apply_update(&d, &spec, false).unwrap();
        assert_eq!(Value::Object(replaced), json!({"_id": 7, "y": 2}));
    }

    #[test]
    fn test_pipeline_update() {
        let d = doc(json!({"_id": 1, "x": 1, "y": 2}));
        let spec = UpdateSpec::from_update(&json!([{"$set": {"z": "$x"}}, {"$unset": "y"}])).unwrap();
        let updated = apply_update(&d, &spec, false).unwrap();
        assert_eq!(Value::Object(updated), json!({"_id": 1, "x": 1, "z": 1}));
    }

    #[test]
    fn test_projection_modes() {
        let d = doc(json!({"_id": 1, "a": 1, "b": 2}));
        let included = project(&d, &doc(json!({"a": 1}))).unwrap();
        assert_eq!(Value::Object(included), json!({"_id": 1, "a": 1}));
        let excluded = project(&d, &doc(json!({"a": 0, "_id": 0}))).unwrap();
        assert_eq!(Value::Object(excluded), json!({"b": 2}));
        assert!(project(&d, &doc(json!({"a": 1, "b": 0}))).is_err());
    }

    #[test]
    fn test_pipeline_stages() {
        let docs: Vec<Document> = (1..=5).map(|i| doc(json!({"_id": i, "x": i % 2}))).collect();
        let pipeline = vec![
            doc(json!({"$match": {"x": 1}})),
            doc(json!({"$sort": {"_id": -1}})),
            doc(json!({"$limit": 2})),
        ];
        let out = run_pipeline(docs.clone(), &pipeline).unwrap();
        let ids: Vec<Value> = out.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(5), json!(3)]);

        let counted = run_pipeline(docs, &[doc(json!({"$count": "total"}))]).unwrap();
        assert_eq!(Value::Object(counted[0].clone()), json!({"total": 5}));
    }
}
