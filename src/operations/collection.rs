// ============================================================================
// Collection Operations
// ============================================================================

use super::arguments::Arguments;
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::service::{
    AggregateOptions, BulkWriteOptions, ChangeStreamOptions, ClientSession, Collection,
    CountOptions, DeleteOptions, FindOneAndModifyOptions, FindOptions, IndexOptions,
    InsertManyOptions, InsertOneOptions, ReturnDocument, UpdateOptions, WriteModel,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const FIND_ARGS: &[&str] = &[
    "filter",
    "sort",
    "projection",
    "skip",
    "limit",
    "batchSize",
    "comment",
    "hint",
    "allowDiskUse",
    "maxTimeMS",
    "session",
];
const AGGREGATE_ARGS: &[&str] = &[
    "pipeline",
    "batchSize",
    "comment",
    "allowDiskUse",
    "let",
    "maxTimeMS",
    "session",
];
pub(crate) const CHANGE_STREAM_ARGS: &[&str] = &[
    "pipeline",
    "fullDocument",
    "fullDocumentBeforeChange",
    "batchSize",
    "maxAwaitTimeMS",
    "showExpandedEvents",
    "comment",
    "session",
];
const UPDATE_ARGS: &[&str] = &[
    "filter",
    "update",
    "upsert",
    "sort",
    "hint",
    "comment",
    "let",
    "session",
];
const REPLACE_ARGS: &[&str] = &[
    "filter",
    "replacement",
    "upsert",
    "sort",
    "hint",
    "comment",
    "let",
    "session",
];
const DELETE_ARGS: &[&str] = &["filter", "hint", "comment", "let", "session"];
const FIND_AND_MODIFY_ARGS: &[&str] = &[
    "filter",
    "update",
    "replacement",
    "sort",
    "projection",
    "upsert",
    "returnDocument",
    "hint",
    "comment",
    "let",
    "session",
];

pub(crate) fn find_options(args: &Arguments) -> Result<FindOptions> {
    Ok(FindOptions {
        sort: args.document("sort")?,
        projection: args.document("projection")?,
        skip: args.u64("skip")?,
        limit: args.i64("limit")?,
        batch_size: args.usize("batchSize")?,
        comment: args.value("comment"),
        hint: args.value("hint"),
        allow_disk_use: args.bool("allowDiskUse")?,
        max_time_ms: args.u64("maxTimeMS")?,
    })
}

pub(crate) fn aggregate_options(args: &Arguments) -> Result<AggregateOptions> {
    Ok(AggregateOptions {
        batch_size: args.usize("batchSize")?,
        comment: args.value("comment"),
        allow_disk_use: args.bool("allowDiskUse")?,
        let_vars: args.document("let")?,
        max_time_ms: args.u64("maxTimeMS")?,
    })
}

pub(crate) fn change_stream_options(args: &Arguments) -> Result<ChangeStreamOptions> {
    Ok(ChangeStreamOptions {
        full_document: args.string("fullDocument")?,
        full_document_before_change: args.string("fullDocumentBeforeChange")?,
        batch_size: args.usize("batchSize")?,
        max_await_time_ms: args.u64("maxAwaitTimeMS")?,
        show_expanded_events: args.bool("showExpandedEvents")?,
        comment: args.value("comment"),
    })
}

fn update_options(args: &Arguments) -> Result<UpdateOptions> {
    Ok(UpdateOptions {
        upsert: args.bool("upsert")?.unwrap_or(false),
        sort: args.document("sort")?,
        hint: args.value("hint"),
        comment: args.value("comment"),
        let_vars: args.document("let")?,
    })
}

fn delete_options(args: &Arguments) -> Result<DeleteOptions> {
    Ok(DeleteOptions {
        hint: args.value("hint"),
        comment: args.value("comment"),
        let_vars: args.document("let")?,
    })
}

fn find_and_modify_options(args: &Arguments) -> Result<FindOneAndModifyOptions> {
    let return_document = match args.string("returnDocument")?.as_deref() {
        None | Some("Before") => ReturnDocument::Before,
        Some("After") => ReturnDocument::After,
        Some(other) => {
            return Err(RunnerError::format(format!("Invalid returnDocument '{}'", other)));
        }
    };
    Ok(FindOneAndModifyOptions {
        sort: args.document("sort")?,
        projection: args.document("projection")?,
        upsert: args.bool("upsert")?.unwrap_or(false),
        return_document,
        hint: args.value("hint"),
        comment: args.value("comment"),
        let_vars: args.document("let")?,
    })
}

/// An update document or an update pipeline.
fn update_value(args: &Arguments, key: &str) -> Result<Value> {
    match args.required_value(key)? {
        value @ (Value::Object(_) | Value::Array(_)) => Ok(value),
        _ => Err(RunnerError::format(format!(
            "Argument '{}' must be a document or a pipeline",
            key
        ))),
    }
}

fn write_model(request: &Document) -> Result<WriteModel> {
    let mut entries = request.iter();
    let (Some((kind, Value::Object(body))), None) = (entries.next(), entries.next()) else {
        return Err(RunnerError::format(format!("Invalid bulkWrite request {:?}", request)));
    };
    let allowed: &[&str] = match kind.as_str() {
        "insertOne" => &["document"],
        "updateOne" | "updateMany" => &["filter", "update", "upsert", "hint", "sort"],
        "replaceOne" => &["filter", "replacement", "upsert", "hint", "sort"],
        "deleteOne" | "deleteMany" => &["filter", "hint"],
        other => {
            return Err(RunnerError::format(format!("Unknown bulkWrite request '{}'", other)));
        }
    };
    let args = Arguments::new(kind, body.clone(), allowed)?;
    let upsert = args.bool("upsert")?.unwrap_or(false);
    Ok(match kind.as_str() {
        "insertOne" => WriteModel::InsertOne {
            document: args.required_document("document")?,
        },
        "updateOne" => WriteModel::UpdateOne {
            filter: args.required_document("filter")?,
            update: update_value(&args, "update")?,
            upsert,
        },
        "updateMany" => WriteModel::UpdateMany {
            filter: args.required_document("filter")?,
            update: update_value(&args, "update")?,
            upsert,
        },
        "replaceOne" => WriteModel::ReplaceOne {
            filter: args.required_document("filter")?,
            replacement: args.required_document("replacement")?,
            upsert,
        },
        "deleteOne" => WriteModel::DeleteOne {
            filter: args.required_document("filter")?,
        },
        _ => WriteModel::DeleteMany {
            filter: args.required_document("filter")?,
        },
    })
}

enum Call {
    Aggregate { pipeline: Vec<Document>, options: AggregateOptions },
    BulkWrite { models: Vec<WriteModel>, options: BulkWriteOptions },
    CountDocuments { filter: Document, options: CountOptions },
    EstimatedDocumentCount { comment: Option<Value> },
    CreateFindCursor { filter: Document, options: FindOptions },
    Find { filter: Document, options: FindOptions },
    FindOne { filter: Document, options: FindOptions },
    CreateIndex { keys: Document, options: IndexOptions },
    DropIndex { name: String },
    ListIndexes,
    CreateChangeStream { pipeline: Vec<Document>, options: ChangeStreamOptions },
    DeleteMany { filter: Document, options: DeleteOptions },
    DeleteOne { filter: Document, options: DeleteOptions },
    Distinct { field: String, filter: Document },
    Drop,
    FindOneAndDelete { filter: Document, options: FindOneAndModifyOptions },
    FindOneAndReplace { filter: Document, replacement: Document, options: FindOneAndModifyOptions },
    FindOneAndUpdate { filter: Document, update: Value, options: FindOneAndModifyOptions },
    InsertMany { documents: Vec<Document>, options: InsertManyOptions },
    InsertOne { document: Document, options: InsertOneOptions },
    ReplaceOne { filter: Document, replacement: Document, options: UpdateOptions },
    UpdateMany { filter: Document, update: Value, options: UpdateOptions },
    UpdateOne { filter: Document, update: Value, options: UpdateOptions },
}

pub struct CollectionOperation {
    collection: Collection,
    session: Option<ClientSession>,
    call: Call,
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let collection = ctx.entities.collection(target)?;
    let allowed: &[&str] = match name {
        "aggregate" => AGGREGATE_ARGS,
        "bulkWrite" => &["requests", "ordered", "comment", "let", "session"],
        "countDocuments" => &["filter", "skip", "limit", "comment", "hint", "session"],
        "estimatedDocumentCount" => &["comment", "maxTimeMS", "session"],
        "createFindCursor" | "find" | "findOne" => FIND_ARGS,
        "createIndex" => &["keys", "name", "unique", "session"],
        "dropIndex" => &["name", "session"],
        "listIndexes" | "drop" => &["session"],
        "createChangeStream" => CHANGE_STREAM_ARGS,
        "deleteMany" | "deleteOne" => DELETE_ARGS,
        "distinct" => &["fieldName", "filter", "comment", "session"],
        "findOneAndDelete" | "findOneAndReplace" | "findOneAndUpdate" => FIND_AND_MODIFY_ARGS,
        "insertMany" => &["documents", "ordered", "comment", "bypassDocumentValidation", "session"],
        "insertOne" => &["document", "comment", "bypassDocumentValidation", "session"],
        "replaceOne" => REPLACE_ARGS,
        "updateMany" | "updateOne" => UPDATE_ARGS,
        other => {
            return Err(RunnerError::format(format!(
                "Unsupported collection operation '{}'",
                other
            )));
        }
    };
    let args = Arguments::new(name, arguments, allowed)?;
    let session = args.session(&ctx.entities)?;

    let call = match name {
        "aggregate" => Call::Aggregate {
            pipeline: args.required_documents("pipeline")?,
            options: aggregate_options(&args)?,
        },
        "bulkWrite" => Call::BulkWrite {
            models: args
                .required_documents("requests")?
                .iter()
                .map(write_model)
                .collect::<Result<Vec<_>>>()?,
            options: BulkWriteOptions {
                ordered: args.bool("ordered")?.unwrap_or(true),
                comment: args.value("comment"),
                let_vars: args.document("let")?,
            },
        },
        "countDocuments" => Call::CountDocuments {
            filter: args.required_document("filter")?,
            options: CountOptions {
                skip: args.u64("skip")?,
                limit: args.u64("limit")?,
                comment: args.value("comment"),
                hint: args.value("hint"),
            },
        },
        "estimatedDocumentCount" => Call::EstimatedDocumentCount {
            comment: args.value("comment"),
        },
        "createFindCursor" => Call::CreateFindCursor {
            filter: args.document("filter")?.unwrap_or_default(),
            options: find_options(&args)?,
        },
        "find" => Call::Find {
            filter: args.required_document("filter")?,
            options: find_options(&args)?,
        },
        "findOne" => Call::FindOne {
            filter: args.required_document("filter")?,
            options: find_options(&args)?,
        },
        "createIndex" => Call::CreateIndex {
            keys: args.required_document("keys")?,
            options: IndexOptions {
                name: args.string("name")?,
                unique: args.bool("unique")?.unwrap_or(false),
            },
        },
        "dropIndex" => Call::DropIndex {
            name: args.required_string("name")?,
        },
        "listIndexes" => Call::ListIndexes,
        "createChangeStream" => Call::CreateChangeStream {
            pipeline: args.required_documents("pipeline")?,
            options: change_stream_options(&args)?,
        },
        "deleteMany" => Call::DeleteMany {
            filter: args.required_document("filter")?,
            options: delete_options(&args)?,
        },
        "deleteOne" => Call::DeleteOne {
            filter: args.required_document("filter")?,
            options: delete_options(&args)?,
        },
        "distinct" => Call::Distinct {
            field: args.required_string("fieldName")?,
            filter: args.required_document("filter")?,
        },
        "drop" => Call::Drop,
        "findOneAndDelete" => Call::FindOneAndDelete {
            filter: args.required_document("filter")?,
            options: find_and_modify_options(&args)?,
        },
        "findOneAndReplace" => Call::FindOneAndReplace {
            filter: args.required_document("filter")?,
            replacement: args.required_document("replacement")?,
            options: find_and_modify_options(&args)?,
        },
        "findOneAndUpdate" => Call::FindOneAndUpdate {
            filter: args.required_document("filter")?,
            update: update_value(&args, "update")?,
            options: find_and_modify_options(&args)?,
        },
        "insertMany" => Call::InsertMany {
            documents: args.required_documents("documents")?,
            options: InsertManyOptions {
                ordered: args.bool("ordered")?.unwrap_or(true),
                bypass_document_validation: args.bool("bypassDocumentValidation")?,
                comment: args.value("comment"),
            },
        },
        "insertOne" => Call::InsertOne {
            document: args.required_document("document")?,
            options: InsertOneOptions {
                bypass_document_validation: args.bool("bypassDocumentValidation")?,
                comment: args.value("comment"),
            },
        },
        "replaceOne" => Call::ReplaceOne {
            filter: args.required_document("filter")?,
            replacement: args.required_document("replacement")?,
            options: update_options(&args)?,
        },
        "updateMany" => Call::UpdateMany {
            filter: args.required_document("filter")?,
            update: update_value(&args, "update")?,
            options: update_options(&args)?,
        },
        _ => Call::UpdateOne {
            filter: args.required_document("filter")?,
            update: update_value(&args, "update")?,
            options: update_options(&args)?,
        },
    };

    Ok(Operation::Entity(Box::new(CollectionOperation {
        collection,
        session,
        call,
    })))
}

fn values(values: Vec<Value>) -> OperationResult {
    OperationResult::Value(Value::Array(values))
}

#[async_trait]
impl EntityOperation for CollectionOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        let coll = &self.collection;
        let session = self.session.as_ref();
        match &self.call {
            Call::Aggregate { pipeline, options } => coll
                .aggregate(pipeline.clone(), options.clone(), session, cancel)
                .and_then(|cursor| cursor.collect_all(cancel))
                .into_result(OperationResult::documents),
            Call::BulkWrite { models, options } => coll
                .bulk_write(models.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::CountDocuments { filter, options } => coll
                .count_documents(filter, options.clone(), session, cancel)
                .into_result(|n| OperationResult::Value(Value::from(n))),
            Call::EstimatedDocumentCount { comment } => coll
                .estimated_document_count(comment.clone(), session, cancel)
                .into_result(|n| OperationResult::Value(Value::from(n))),
            Call::CreateFindCursor { filter, options } => coll
                .find(filter, options.clone(), session, cancel)
                .into_result(OperationResult::Cursor),
            Call::Find { filter, options } => coll
                .find(filter, options.clone(), session, cancel)
                .and_then(|cursor| cursor.collect_all(cancel))
                .into_result(OperationResult::documents),
            Call::FindOne { filter, options } => coll
                .find_one(filter, options.clone(), session, cancel)
                .into_result(OperationResult::optional_document),
            Call::CreateIndex { keys, options } => coll
                .create_index(keys.clone(), options.clone(), session, cancel)
                .into_result(|name| OperationResult::Value(Value::String(name))),
            Call::DropIndex { name } => coll.drop_index(name, session, cancel).into_empty(),
            Call::ListIndexes => coll
                .list_indexes(session, cancel)
                .into_result(OperationResult::documents),
            Call::CreateChangeStream { pipeline, options } => coll
                .watch(pipeline.clone(), options.clone(), session, cancel)
                .into_result(OperationResult::ChangeStream),
            Call::DeleteMany { filter, options } => coll
                .delete_many(filter, options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::DeleteOne { filter, options } => coll
                .delete_one(filter, options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::Distinct { field, filter } => coll
                .distinct(field, filter, session, cancel)
                .into_result(values),
            Call::Drop => coll.drop(session, cancel).into_empty(),
            Call::FindOneAndDelete { filter, options } => coll
                .find_one_and_delete(filter, options.clone(), session, cancel)
                .into_result(OperationResult::optional_document),
            Call::FindOneAndReplace {
                filter,
                replacement,
                options,
            } => coll
                .find_one_and_replace(filter, replacement.clone(), options.clone(), session, cancel)
                .into_result(OperationResult::optional_document),
            Call::FindOneAndUpdate { filter, update, options } => coll
                .find_one_and_update(filter, update.clone(), options.clone(), session, cancel)
                .into_result(OperationResult::optional_document),
            Call::InsertMany { documents, options } => coll
                .insert_many(documents.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::InsertOne { document, options } => coll
                .insert_one(document.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::ReplaceOne {
                filter,
                replacement,
                options,
            } => coll
                .replace_one(filter, replacement.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::UpdateMany { filter, update, options } => coll
                .update_many(filter, update.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
            Call::UpdateOne { filter, update, options } => coll
                .update_one(filter, update.clone(), options.clone(), session, cancel)
                .into_result(|r| OperationResult::serialized(&r)),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        let coll = &self.collection;
        let session = self.session.as_ref();
        match &self.call {
            Call::Aggregate { pipeline, options } => {
                match coll
                    .aggregate_async(pipeline.clone(), options.clone(), session, cancel)
                    .await
                {
                    Ok(cursor) => cursor
                        .collect_all_async(cancel)
                        .await
                        .into_result(OperationResult::documents),
                    Err(err) => OperationResult::Error(err),
                }
            }
            Call::BulkWrite { models, options } => coll
                .bulk_write_async(models.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::CountDocuments { filter, options } => coll
                .count_documents_async(filter, options.clone(), session, cancel)
                .await
                .into_result(|n| OperationResult::Value(Value::from(n))),
            Call::EstimatedDocumentCount { comment } => coll
                .estimated_document_count_async(comment.clone(), session, cancel)
                .await
                .into_result(|n| OperationResult::Value(Value::from(n))),
            Call::CreateFindCursor { filter, options } => coll
                .find_async(filter, options.clone(), session, cancel)
                .await
                .into_result(OperationResult::Cursor),
            Call::Find { filter, options } => match coll
                .find_async(filter, options.clone(), session, cancel)
                .await
            {
                Ok(cursor) => cursor
                    .collect_all_async(cancel)
                    .await
                    .into_result(OperationResult::documents),
                Err(err) => OperationResult::Error(err),
            },
            Call::FindOne { filter, options } => coll
                .find_one_async(filter, options.clone(), session, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::CreateIndex { keys, options } => coll
                .create_index_async(keys.clone(), options.clone(), session, cancel)
                .await
                .into_result(|name| OperationResult::Value(Value::String(name))),
            Call::DropIndex { name } => {
                coll.drop_index_async(name, session, cancel).await.into_empty()
            }
            Call::ListIndexes => coll
                .list_indexes_async(session, cancel)
                .await
                .into_result(OperationResult::documents),
            Call::CreateChangeStream { pipeline, options } => coll
                .watch_async(pipeline.clone(), options.clone(), session, cancel)
                .await
                .into_result(OperationResult::ChangeStream),
            Call::DeleteMany { filter, options } => coll
                .delete_many_async(filter, options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::DeleteOne { filter, options } => coll
                .delete_one_async(filter, options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::Distinct { field, filter } => coll
                .distinct_async(field, filter, session, cancel)
                .await
                .into_result(values),
            Call::Drop => coll.drop_async(session, cancel).await.into_empty(),
            Call::FindOneAndDelete { filter, options } => coll
                .find_one_and_delete_async(filter, options.clone(), session, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::FindOneAndReplace {
                filter,
                replacement,
                options,
            } => coll
                .find_one_and_replace_async(
                    filter,
                    replacement.clone(),
                    options.clone(),
                    session,
                    cancel,
                )
                .await
                .into_result(OperationResult::optional_document),
            Call::FindOneAndUpdate { filter, update, options } => coll
                .find_one_and_update_async(filter, update.clone(), options.clone(), session, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::InsertMany { documents, options } => coll
                .insert_many_async(documents.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::InsertOne { document, options } => coll
                .insert_one_async(document.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::ReplaceOne {
                filter,
                replacement,
                options,
            } => coll
                .replace_one_async(filter, replacement.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::UpdateMany { filter, update, options } => coll
                .update_many_async(filter, update.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
            Call::UpdateOne { filter, update, options } => coll
                .update_one_async(filter, update.clone(), options.clone(), session, cancel)
                .await
                .into_result(|r| OperationResult::serialized(&r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_write_model_parsing() {
        let model = write_model(&doc(json!({"updateOne": {"filter": {"_id": 1}, "update": {"$set": {"x": 1}}, "upsert": true}}))).unwrap();
        assert!(matches!(model, WriteModel::UpdateOne { upsert: true, .. }));
        assert!(write_model(&doc(json!({"insertOne": {"document": {}, "extra": 1}}))).is_err());
        assert!(write_model(&doc(json!({"mergeOne": {}}))).is_err());
        assert!(write_model(&doc(json!({"insertOne": {"document": {}}, "deleteOne": {"filter": {}}}))).is_err());
    }

    #[test]
    fn test_return_document_values() {
        let args = Arguments::new("findOneAndUpdate", doc(json!({"returnDocument": "After"})), FIND_AND_MODIFY_ARGS).unwrap();
        assert_eq!(find_and_modify_options(&args).unwrap().return_document, ReturnDocument::After);
        let args = Arguments::new("findOneAndUpdate", doc(json!({"returnDocument": "Later"})), FIND_AND_MODIFY_ARGS).unwrap();
        assert!(find_and_modify_options(&args).is_err());
    }
}
