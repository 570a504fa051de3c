use crate::core::Document;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    pub inserted_ids: BTreeMap<usize, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub deleted_count: u64,
    pub inserted_count: u64,
    pub inserted_ids: BTreeMap<usize, Value>,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_ids: BTreeMap<usize, Value>,
}

/// Serialize a result struct into the document form scenarios compare against.
pub fn to_document<T: Serialize>(result: &T) -> Document {
    match serde_json::to_value(result) {
        Ok(Value::Object(map)) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_documents_use_camel_case_keys() {
        let mut result = InsertManyResult::default();
        result.inserted_ids.insert(0, json!(1));
        result.inserted_ids.insert(1, json!(2));
        assert_eq!(
            Value::Object(to_document(&result)),
            json!({"insertedIds": {"0": 1, "1": 2}})
        );

        let update = UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_count: 0,
            upserted_id: None,
        };
        assert_eq!(
            Value::Object(to_document(&update)),
            json!({"matchedCount": 1, "modifiedCount": 1, "upsertedCount": 0})
        );
    }
}
