// ============================================================================
// Collection
// ============================================================================

use super::change_stream::{ChangeStream, ChangeStreamOptions, StreamScope};
use super::client::{Client, CommandContext, CommandRequest, RetryKind};
use super::cursor::{Cursor, cursor_reply};
use super::error::{ServiceError, ServiceResult};
use super::query::{UpdateSpec, matches_filter, project, run_pipeline};
use super::results::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, to_document,
};
use super::session::ClientSession;
use super::store::{FindSpec, Namespace, UpdateMode, UpdateOutcome};
use crate::core::document::{Document, DocumentExt, values_equal};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub batch_size: Option<usize>,
    pub comment: Option<Value>,
    pub hint: Option<Value>,
    pub allow_disk_use: Option<bool>,
    pub max_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub batch_size: Option<usize>,
    pub comment: Option<Value>,
    pub allow_disk_use: Option<bool>,
    pub let_vars: Option<Document>,
    pub max_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct InsertOneOptions {
    pub bypass_document_validation: Option<bool>,
    pub comment: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct InsertManyOptions {
    pub ordered: bool,
    pub bypass_document_validation: Option<bool>,
    pub comment: Option<Value>,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            bypass_document_validation: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub sort: Option<Document>,
    pub hint: Option<Value>,
    pub comment: Option<Value>,
    pub let_vars: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub hint: Option<Value>,
    pub comment: Option<Value>,
    pub let_vars: Option<Document>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, Default)]
pub struct FindOneAndModifyOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub upsert: bool,
    pub return_document: ReturnDocument,
    pub hint: Option<Value>,
    pub comment: Option<Value>,
    pub let_vars: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub comment: Option<Value>,
    pub hint: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct BulkWriteOptions {
    pub ordered: bool,
    pub comment: Option<Value>,
    pub let_vars: Option<Document>,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            comment: None,
            let_vars: None,
        }
    }
}

/// One request of a bulk write.
#[derive(Debug, Clone)]
pub enum WriteModel {
    InsertOne { document: Document },
    UpdateOne { filter: Document, update: Value, upsert: bool },
    UpdateMany { filter: Document, update: Value, upsert: bool },
    ReplaceOne { filter: Document, replacement: Document, upsert: bool },
    DeleteOne { filter: Document },
    DeleteMany { filter: Document },
}

impl WriteModel {
    fn command_name(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insert",
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => "delete",
            _ => "update",
        }
    }

    fn command_entry(&self) -> Value {
        match self {
            WriteModel::InsertOne { document } => Value::Object(document.clone()),
            WriteModel::UpdateOne { filter, update, upsert }
            | WriteModel::UpdateMany { filter, update, upsert } => json!({
                "q": filter,
                "u": update,
                "multi": matches!(self, WriteModel::UpdateMany { .. }),
                "upsert": upsert
            }),
            WriteModel::ReplaceOne { filter, replacement, upsert } => json!({
                "q": filter,
                "u": replacement,
                "multi": false,
                "upsert": upsert
            }),
            WriteModel::DeleteOne { filter } => json!({"q": filter, "limit": 1}),
            WriteModel::DeleteMany { filter } => json!({"q": filter, "limit": 0}),
        }
    }
}

fn documents_value(docs: &[Document]) -> Value {
    Value::Array(docs.iter().cloned().map(Value::Object).collect())
}

fn put_optional(command: &mut Document, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        command.insert(key.to_string(), value);
    }
}

// ============================================================================
// Collection handle
// ============================================================================

/// Handle on one namespace of a deployment.
///
/// Every method has an `_async` twin that yields once, honours the
/// cancellation token, then runs the blocking form.
///
/// ```
/// use rustmemodb_unified::service::{
///     Client, ClientOptions, Deployment, FindOptions, InsertOneOptions, ServerInfo,
/// };
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
///
/// let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
/// let coll = client.database("app").collection("users");
/// let cancel = CancellationToken::new();
/// let doc = json!({"_id": 1, "name": "ada"}).as_object().cloned().unwrap();
///
/// # tokio_test::block_on(async {
/// coll.insert_one_async(doc, InsertOneOptions::default(), None, &cancel).await.unwrap();
/// let filter = json!({"name": "ada"}).as_object().cloned().unwrap();
/// let found = coll.find_one_async(&filter, FindOptions::default(), None, &cancel).await.unwrap();
/// assert_eq!(found.unwrap()["_id"], json!(1));
/// # });
/// ```
#[derive(Clone)]
pub struct Collection {
    client: Client,
    namespace: Namespace,
    read_concern: Option<Document>,
    write_concern: Option<Document>,
}

impl Collection {
    pub(crate) fn new(
        client: Client,
        namespace: Namespace,
        read_concern: Option<Document>,
        write_concern: Option<Document>,
    ) -> Self {
        Self {
            client,
            namespace,
            read_concern,
            write_concern,
        }
    }

    pub fn with_concerns(
        mut self,
        read_concern: Option<Document>,
        write_concern: Option<Document>,
    ) -> Self {
        if read_concern.is_some() {
            self.read_concern = read_concern;
        }
        if write_concern.is_some() {
            self.write_concern = write_concern;
        }
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.namespace.coll
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn base_command(&self, name: &str) -> Document {
        let mut command = Document::new();
        command.insert(name.to_string(), Value::String(self.namespace.coll.clone()));
        command
    }

    fn with_write_concern(
        &self,
        mut command: Document,
        session: Option<&ClientSession>,
    ) -> ServiceResult<Document> {
        let in_transaction = match session {
            Some(session) => session.in_transaction()?,
            None => false,
        };
        if let (Some(write_concern), false) = (&self.write_concern, in_transaction) {
            command.insert("writeConcern".to_string(), Value::Object(write_concern.clone()));
        }
        Ok(command)
    }

    fn with_read_concern(
        &self,
        mut command: Document,
        session: Option<&ClientSession>,
    ) -> ServiceResult<Document> {
        let in_transaction = match session {
            Some(session) => session.in_transaction()?,
            None => false,
        };
        if let (Some(read_concern), false) = (&self.read_concern, in_transaction) {
            command.insert("readConcern".to_string(), Value::Object(read_concern.clone()));
        }
        Ok(command)
    }

    fn execute<T>(
        &self,
        name: &str,
        command: Document,
        retry: RetryKind,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
        body: impl FnMut(&CommandContext<'_>) -> ServiceResult<(T, Document)>,
    ) -> ServiceResult<T> {
        let request = CommandRequest::new(&self.namespace.db, name, command)
            .session(session)
            .retry(retry);
        self.client.execute(request, cancel, body)
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    pub fn insert_one(
        &self,
        document: Document,
        options: InsertOneOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<InsertOneResult> {
        let many = InsertManyOptions {
            ordered: true,
            bypass_document_validation: options.bypass_document_validation,
            comment: options.comment,
        };
        let result = self.insert_many(vec![document], many, session, cancel)?;
        let inserted_id = result.inserted_ids.into_values().next().unwrap_or(Value::Null);
        Ok(InsertOneResult { inserted_id })
    }

    pub fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<InsertManyResult> {
        if documents.is_empty() {
            return Err(ServiceError::invalid_argument("No documents to insert"));
        }
        let mut command = self.base_command("insert");
        command.insert("documents".to_string(), documents_value(&documents));
        command.insert("ordered".to_string(), Value::Bool(options.ordered));
        put_optional(&mut command, "comment", options.comment.clone());
        let command = self.with_write_concern(command, session)?;

        self.execute("insert", command, RetryKind::Write, session, cancel, |ctx| {
            let (ids, failure) = ctx.write(|ws| {
                let mut ids = BTreeMap::new();
                let mut failure = None;
                for (index, doc) in documents.iter().enumerate() {
                    match ws.insert_many(&self.namespace, vec![doc.clone()]) {
                        Ok(mut inserted) => {
                            if let Some(id) = inserted.pop() {
                                ids.insert(index, id);
                            }
                        }
                        Err(err) => {
                            failure.get_or_insert(err);
                            if options.ordered {
                                break;
                            }
                        }
                    }
                }
                Ok((ids, failure))
            })?;
            let result = InsertManyResult { inserted_ids: ids };
            if let Some(err) = failure {
                return Err(err.with_partial_result(to_document(&result)));
            }
            let reply = json!({"n": result.inserted_ids.len(), "ok": 1});
            Ok((result, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    // ------------------------------------------------------------------
    // Updates & deletes
    // ------------------------------------------------------------------

    fn run_update(
        &self,
        filter: &Document,
        spec: UpdateSpec,
        raw_update: Value,
        multi: bool,
        options: UpdateOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<UpdateResult> {
        let mut statement =
            json!({"q": filter, "u": raw_update, "multi": multi, "upsert": options.upsert});
        if let Some(sort) = &options.sort {
            statement["sort"] = Value::Object(sort.clone());
        }
        if let Some(hint) = &options.hint {
            statement["hint"] = hint.clone();
        }
        let mut command = self.base_command("update");
        command.insert("updates".to_string(), json!([statement]));
        command.insert("ordered".to_string(), Value::Bool(true));
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "let", options.let_vars.clone().map(Value::Object));
        let command = self.with_write_concern(command, session)?;
        let retry = if multi { RetryKind::None } else { RetryKind::Write };

        self.execute("update", command, retry, session, cancel, |ctx| {
            let mode = UpdateMode {
                multi,
                upsert: options.upsert,
                sort: options.sort.as_ref(),
            };
            let outcome = ctx.write(|ws| ws.update(&self.namespace, filter, &spec, mode))?;
            let result = update_result(&outcome);
            let mut reply = json!({
                "n": result.matched_count + result.upserted_count,
                "nModified": result.modified_count,
                "ok": 1
            });
            if let Some(id) = &result.upserted_id {
                reply["upserted"] = json!([{"index": 0, "_id": id}]);
            }
            Ok((result, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn update_one(
        &self,
        filter: &Document,
        update: Value,
        options: UpdateOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<UpdateResult> {
        let spec = UpdateSpec::from_update(&update)?;
        self.run_update(filter, spec, update, false, options, session, cancel)
    }

    pub fn update_many(
        &self,
        filter: &Document,
        update: Value,
        options: UpdateOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<UpdateResult> {
        let spec = UpdateSpec::from_update(&update)?;
        self.run_update(filter, spec, update, true, options, session, cancel)
    }

    pub fn replace_one(
        &self,
        filter: &Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<UpdateResult> {
        let spec = UpdateSpec::from_replacement(&replacement)?;
        self.run_update(filter, spec, Value::Object(replacement), false, options, session, cancel)
    }

    fn run_delete(
        &self,
        filter: &Document,
        multi: bool,
        options: DeleteOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<DeleteResult> {
        let mut statement = json!({"q": filter, "limit": if multi { 0 } else { 1 }});
        if let Some(hint) = &options.hint {
            statement["hint"] = hint.clone();
        }
        let mut command = self.base_command("delete");
        command.insert("deletes".to_string(), json!([statement]));
        command.insert("ordered".to_string(), Value::Bool(true));
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "let", options.let_vars.clone().map(Value::Object));
        let command = self.with_write_concern(command, session)?;
        let retry = if multi { RetryKind::None } else { RetryKind::Write };

        self.execute("delete", command, retry, session, cancel, |ctx| {
            let removed = ctx.write(|ws| ws.delete(&self.namespace, filter, multi, None))?;
            let deleted_count = removed.len() as u64;
            let reply = json!({"n": deleted_count, "ok": 1});
            Ok((DeleteResult { deleted_count }, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn delete_one(
        &self,
        filter: &Document,
        options: DeleteOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<DeleteResult> {
        self.run_delete(filter, false, options, session, cancel)
    }

    pub fn delete_many(
        &self,
        filter: &Document,
        options: DeleteOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<DeleteResult> {
        self.run_delete(filter, true, options, session, cancel)
    }

    // ------------------------------------------------------------------
    // findAndModify family
    // ------------------------------------------------------------------

    fn find_and_modify(
        &self,
        filter: &Document,
        modification: Option<(UpdateSpec, Value)>,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let mut command = self.base_command("findAndModify");
        command.insert("query".to_string(), Value::Object(filter.clone()));
        put_optional(&mut command, "sort", options.sort.clone().map(Value::Object));
        put_optional(&mut command, "fields", options.projection.clone().map(Value::Object));
        match &modification {
            None => {
                command.insert("remove".to_string(), Value::Bool(true));
            }
            Some((_, raw)) => {
                command.insert("update".to_string(), raw.clone());
                command.insert(
                    "new".to_string(),
                    Value::Bool(options.return_document == ReturnDocument::After),
                );
                command.insert("upsert".to_string(), Value::Bool(options.upsert));
            }
        }
        put_optional(&mut command, "hint", options.hint.clone());
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "let", options.let_vars.clone().map(Value::Object));
        let command = self.with_write_concern(command, session)?;

        self.execute("findAndModify", command, RetryKind::Write, session, cancel, |ctx| {
            let value = match &modification {
                None => ctx
                    .write(|ws| ws.delete(&self.namespace, filter, false, options.sort.as_ref()))?
                    .into_iter()
                    .next(),
                Some((spec, _)) => {
                    let mode = UpdateMode {
                        multi: false,
                        upsert: options.upsert,
                        sort: options.sort.as_ref(),
                    };
                    let outcome = ctx.write(|ws| ws.update(&self.namespace, filter, spec, mode))?;
                    match options.return_document {
                        ReturnDocument::Before => outcome.before,
                        ReturnDocument::After => outcome.after,
                    }
                }
            };
            let value = match (value, &options.projection) {
                (Some(doc), Some(projection)) => Some(project(&doc, projection)?),
                (value, _) => value,
            };
            let reply = json!({"value": value.clone(), "ok": 1});
            Ok((value, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn find_one_and_delete(
        &self,
        filter: &Document,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        self.find_and_modify(filter, None, options, session, cancel)
    }

    pub fn find_one_and_update(
        &self,
        filter: &Document,
        update: Value,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let spec = UpdateSpec::from_update(&update)?;
        self.find_and_modify(filter, Some((spec, update)), options, session, cancel)
    }

    pub fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let spec = UpdateSpec::from_replacement(&replacement)?;
        let replacement = Some((spec, Value::Object(replacement)));
        self.find_and_modify(filter, replacement, options, session, cancel)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Open a live cursor over the matching documents.
    pub fn find(
        &self,
        filter: &Document,
        options: FindOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Cursor> {
        let mut command = self.base_command("find");
        command.insert("filter".to_string(), Value::Object(filter.clone()));
        put_optional(&mut command, "sort", options.sort.clone().map(Value::Object));
        put_optional(&mut command, "projection", options.projection.clone().map(Value::Object));
        put_optional(&mut command, "skip", options.skip.map(Value::from));
        put_optional(&mut command, "limit", options.limit.map(Value::from));
        put_optional(&mut command, "batchSize", options.batch_size.map(|n| Value::from(n as u64)));
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "hint", options.hint.clone());
        put_optional(&mut command, "allowDiskUse", options.allow_disk_use.map(Value::Bool));
        put_optional(&mut command, "maxTimeMS", options.max_time_ms.map(Value::from));
        let command = self.with_read_concern(command, session)?;

        let spec = FindSpec {
            filter: filter.clone(),
            sort: options.sort.clone(),
            projection: options.projection.clone(),
            skip: options.skip.unwrap_or(0),
            limit: options.limit.map(|l| l.unsigned_abs()),
        };
        let batch_size = options.batch_size;
        let (first, id) = self.execute("find", command, RetryKind::Read, session, cancel, |ctx| {
            let documents = ctx.read()?.find(&self.namespace, &spec)?;
            let (first, id) = ctx
                .deployment()
                .open_cursor(self.namespace.clone(), documents, batch_size)?;
            let reply = cursor_reply(&self.namespace, id, "firstBatch", &first);
            Ok(((first, id), reply))
        })?;
        Ok(Cursor::new(
            self.client.clone(),
            self.namespace.clone(),
            first,
            id,
            batch_size,
            session.cloned(),
        ))
    }

    pub fn find_one(
        &self,
        filter: &Document,
        mut options: FindOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        options.limit = Some(1);
        let cursor = self.find(filter, options, session, cancel)?;
        cursor.try_next(cancel)
    }

    pub fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Cursor> {
        let mut command = self.base_command("aggregate");
        command.insert("pipeline".to_string(), documents_value(&pipeline));
        let cursor_options = match options.batch_size {
            Some(size) => json!({"batchSize": size}),
            None => json!({}),
        };
        command.insert("cursor".to_string(), cursor_options);
        put_optional(&mut command, "allowDiskUse", options.allow_disk_use.map(Value::Bool));
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "let", options.let_vars.clone().map(Value::Object));
        put_optional(&mut command, "maxTimeMS", options.max_time_ms.map(Value::from));
        let command = self.with_read_concern(command, session)?;

        let batch_size = options.batch_size;
        let (first, id) = self.execute(
            "aggregate",
            command,
            RetryKind::Read,
            session,
            cancel,
            |ctx| {
                let documents = ctx.read()?.all_documents(&self.namespace);
                let documents = run_pipeline(documents, &pipeline)?;
                let (first, id) = ctx
                    .deployment()
                    .open_cursor(self.namespace.clone(), documents, batch_size)?;
                let reply = cursor_reply(&self.namespace, id, "firstBatch", &first);
                Ok(((first, id), reply))
            },
        )?;
        Ok(Cursor::new(
            self.client.clone(),
            self.namespace.clone(),
            first,
            id,
            batch_size,
            session.cloned(),
        ))
    }

    pub fn count_documents(
        &self,
        filter: &Document,
        options: CountOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<u64> {
        let mut pipeline = vec![json!({"$match": filter})];
        if let Some(skip) = options.skip {
            pipeline.push(json!({"$skip": skip}));
        }
        if let Some(limit) = options.limit {
            pipeline.push(json!({"$limit": limit}));
        }
        pipeline.push(json!({"$group": {"_id": 1, "n": {"$sum": 1}}}));
        let mut command = self.base_command("aggregate");
        command.insert("pipeline".to_string(), Value::Array(pipeline));
        command.insert("cursor".to_string(), json!({}));
        put_optional(&mut command, "comment", options.comment.clone());
        put_optional(&mut command, "hint", options.hint.clone());
        let command = self.with_read_concern(command, session)?;

        self.execute("aggregate", command, RetryKind::Read, session, cancel, |ctx| {
            let spec = FindSpec {
                filter: filter.clone(),
                skip: options.skip.unwrap_or(0),
                limit: options.limit,
                ..FindSpec::default()
            };
            let n = ctx.read()?.find(&self.namespace, &spec)?.len() as u64;
            let batch = if n == 0 {
                Vec::new()
            } else {
                vec![json!({"_id": 1, "n": n}).as_object().cloned().unwrap_or_default()]
            };
            Ok((n, cursor_reply(&self.namespace, 0, "firstBatch", &batch)))
        })
    }

    pub fn estimated_document_count(
        &self,
        comment: Option<Value>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<u64> {
        let mut command = self.base_command("count");
        put_optional(&mut command, "comment", comment);
        let command = self.with_read_concern(command, session)?;
        self.execute("count", command, RetryKind::Read, session, cancel, |ctx| {
            let n = ctx.read()?.all_documents(&self.namespace).len() as u64;
            Ok((n, json!({"n": n, "ok": 1}).as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn distinct(
        &self,
        field: &str,
        filter: &Document,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Value>> {
        let mut command = self.base_command("distinct");
        command.insert("key".to_string(), Value::String(field.to_string()));
        command.insert("query".to_string(), Value::Object(filter.clone()));
        let command = self.with_read_concern(command, session)?;
        self.execute("distinct", command, RetryKind::Read, session, cancel, |ctx| {
            let mut values: Vec<Value> = Vec::new();
            for doc in ctx.read()?.all_documents(&self.namespace) {
                if !matches_filter(&doc, filter)? {
                    continue;
                }
                let found: Vec<Value> = match doc.get_path(field) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                    None => Vec::new(),
                };
                for value in found {
                    if !values.iter().any(|seen| values_equal(seen, &value)) {
                        values.push(value);
                    }
                }
            }
            let reply = json!({"values": values.clone(), "ok": 1});
            Ok((values, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    // ------------------------------------------------------------------
    // Bulk write
    // ------------------------------------------------------------------

    /// Execute write models, one command per run of same-kind models.
    pub fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<BulkWriteResult> {
        if models.is_empty() {
            return Err(ServiceError::invalid_argument("Bulk write requires at least one request"));
        }
        let mut result = BulkWriteResult::default();
        let mut deferred: Option<ServiceError> = None;

        let mut start = 0;
        while start < models.len() {
            let name = models[start].command_name();
            let end = models[start..]
                .iter()
                .position(|model| model.command_name() != name)
                .map(|offset| start + offset)
                .unwrap_or(models.len());
            let group = &models[start..end];

            let entries: Vec<Value> = group.iter().map(WriteModel::command_entry).collect();
            let entries_key = match name {
                "insert" => "documents",
                "update" => "updates",
                _ => "deletes",
            };
            let mut command = self.base_command(name);
            command.insert(entries_key.to_string(), Value::Array(entries));
            command.insert("ordered".to_string(), Value::Bool(options.ordered));
            put_optional(&mut command, "comment", options.comment.clone());
            put_optional(&mut command, "let", options.let_vars.clone().map(Value::Object));
            let command = self.with_write_concern(command, session)?;

            let outcome = self.execute(name, command, RetryKind::None, session, cancel, |ctx| {
                let (partial, failure) = ctx.write(|ws| {
                    let mut partial = BulkWriteResult::default();
                    let mut failure = None;
                    for (offset, model) in group.iter().enumerate() {
                        let index = start + offset;
                        let applied = match model {
                            WriteModel::InsertOne { document } => ws
                                .insert_many(&self.namespace, vec![document.clone()])
                                .map(|mut ids| {
                                    if let Some(id) = ids.pop() {
                                        partial.inserted_ids.insert(index, id);
                                    }
                                    partial.inserted_count += 1;
                                }),
                            WriteModel::UpdateOne { filter, update, upsert }
                            | WriteModel::UpdateMany { filter, update, upsert } => {
                                UpdateSpec::from_update(update).and_then(|spec| {
                                    let mode = UpdateMode {
                                        multi: matches!(model, WriteModel::UpdateMany { .. }),
                                        upsert: *upsert,
                                        sort: None,
                                    };
                                    ws.update(&self.namespace, filter, &spec, mode)
                                        .map(|outcome| record_update(&mut partial, index, &outcome))
                                })
                            }
                            WriteModel::ReplaceOne { filter, replacement, upsert } => {
                                UpdateSpec::from_replacement(replacement).and_then(|spec| {
                                    let mode = UpdateMode {
                                        multi: false,
                                        upsert: *upsert,
                                        sort: None,
                                    };
                                    ws.update(&self.namespace, filter, &spec, mode)
                                        .map(|outcome| record_update(&mut partial, index, &outcome))
                                })
                            }
                            WriteModel::DeleteOne { filter }
                            | WriteModel::DeleteMany { filter } => ws
                                .delete(
                                    &self.namespace,
                                    filter,
                                    matches!(model, WriteModel::DeleteMany { .. }),
                                    None,
                                )
                                .map(|removed| partial.deleted_count += removed.len() as u64),
                        };
                        if let Err(err) = applied {
                            failure.get_or_insert(err);
                            if options.ordered {
                                break;
                            }
                        }
                    }
                    Ok((partial, failure))
                })?;
                let n = partial.inserted_count
                    + partial.matched_count
                    + partial.deleted_count
                    + partial.upserted_count;
                let reply = json!({"n": n, "nModified": partial.modified_count, "ok": 1});
                Ok(((partial, failure), reply.as_object().cloned().unwrap_or_default()))
            })?;

            let (partial, failure) = outcome;
            merge_bulk(&mut result, partial);
            if let Some(err) = failure {
                if options.ordered {
                    return Err(err.with_partial_result(to_document(&result)));
                }
                deferred.get_or_insert(err);
            }
            start = end;
        }

        match deferred {
            Some(err) => Err(err.with_partial_result(to_document(&result))),
            None => Ok(result),
        }
    }

    // ------------------------------------------------------------------
    // Indexes & lifecycle
    // ------------------------------------------------------------------

    pub fn create_index(
        &self,
        keys: Document,
        options: IndexOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<String> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| super::store::IndexModel::default_name(&keys));
        let mut index = json!({"key": keys, "name": name});
        if options.unique {
            index["unique"] = Value::Bool(true);
        }
        let mut command = self.base_command("createIndexes");
        command.insert("indexes".to_string(), json!([index]));
        let command = self.with_write_concern(command, session)?;
        self.execute("createIndexes", command, RetryKind::None, session, cancel, |ctx| {
            let created = ctx.write(|ws| {
                ws.create_index(&self.namespace, keys.clone(), Some(name.clone()), options.unique)
            })?;
            Ok((created, json!({"ok": 1}).as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn drop_index(
        &self,
        name: &str,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let mut command = self.base_command("dropIndexes");
        command.insert("index".to_string(), Value::String(name.to_string()));
        let command = self.with_write_concern(command, session)?;
        self.execute("dropIndexes", command, RetryKind::None, session, cancel, |ctx| {
            ctx.write(|ws| ws.drop_index(&self.namespace, name))?;
            Ok(((), json!({"ok": 1}).as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn list_indexes(
        &self,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Document>> {
        let mut command = self.base_command("listIndexes");
        command.insert("cursor".to_string(), json!({}));
        self.execute("listIndexes", command, RetryKind::Read, session, cancel, |ctx| {
            let indexes: Vec<Document> = ctx
                .read()?
                .indexes(&self.namespace)?
                .iter()
                .map(|index| index.to_document())
                .collect();
            let reply = cursor_reply(&self.namespace, 0, "firstBatch", &indexes);
            Ok((indexes, reply))
        })
    }

    /// Drop the collection; dropping a missing collection succeeds.
    pub fn drop(
        &self,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let command = self.with_write_concern(self.base_command("drop"), session)?;
        self.execute("drop", command, RetryKind::None, session, cancel, |ctx| {
            ctx.write(|ws| Ok(ws.drop_collection(&self.namespace)))?;
            Ok(((), json!({"ok": 1}).as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<ChangeStream> {
        ChangeStream::open(
            self.client.clone(),
            StreamScope::Collection(self.namespace.clone()),
            pipeline,
            options,
            session,
            cancel,
        )
    }

    async_pair!(insert_one_async => insert_one(
        document: Document,
        options: InsertOneOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<InsertOneResult>);
    async_pair!(insert_many_async => insert_many(
        documents: Vec<Document>,
        options: InsertManyOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<InsertManyResult>);
    async_pair!(update_one_async => update_one(
        filter: &Document,
        update: Value,
        options: UpdateOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<UpdateResult>);
    async_pair!(update_many_async => update_many(
        filter: &Document,
        update: Value,
        options: UpdateOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<UpdateResult>);
    async_pair!(replace_one_async => replace_one(
        filter: &Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<UpdateResult>);
    async_pair!(delete_one_async => delete_one(
        filter: &Document,
        options: DeleteOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<DeleteResult>);
    async_pair!(delete_many_async => delete_many(
        filter: &Document,
        options: DeleteOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<DeleteResult>);
    async_pair!(find_one_and_delete_async => find_one_and_delete(
        filter: &Document,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Option<Document>>);
    async_pair!(find_one_and_update_async => find_one_and_update(
        filter: &Document,
        update: Value,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Option<Document>>);
    async_pair!(find_one_and_replace_async => find_one_and_replace(
        filter: &Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Option<Document>>);
    async_pair!(find_async => find(
        filter: &Document,
        options: FindOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Cursor>);
    async_pair!(find_one_async => find_one(
        filter: &Document,
        options: FindOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Option<Document>>);
    async_pair!(aggregate_async => aggregate(
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<Cursor>);
    async_pair!(count_documents_async => count_documents(
        filter: &Document,
        options: CountOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<u64>);
    async_pair!(estimated_document_count_async => estimated_document_count(
        comment: Option<Value>,
        session: Option<&ClientSession>
    ) -> ServiceResult<u64>);
    async_pair!(distinct_async => distinct(
        field: &str,
        filter: &Document,
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<Value>>);
    async_pair!(bulk_write_async => bulk_write(
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<BulkWriteResult>);
    async_pair!(create_index_async => create_index(
        keys: Document,
        options: IndexOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<String>);
    async_pair!(drop_index_async => drop_index(
        name: &str,
        session: Option<&ClientSession>
    ) -> ServiceResult<()>);
    async_pair!(list_indexes_async => list_indexes(
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<Document>>);
    async_pair!(drop_async => drop(session: Option<&ClientSession>) -> ServiceResult<()>);
    async_pair!(watch_async => watch(
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<ChangeStream>);
}

fn update_result(outcome: &UpdateOutcome) -> UpdateResult {
    UpdateResult {
        matched_count: outcome.matched,
        modified_count: outcome.modified,
        upserted_count: u64::from(outcome.upserted_id.is_some()),
        upserted_id: outcome.upserted_id.clone(),
    }
}

fn record_update(result: &mut BulkWriteResult, index: usize, outcome: &UpdateOutcome) {
    result.matched_count += outcome.matched;
    result.modified_count += outcome.modified;
    if let Some(id) = &outcome.upserted_id {
        result.upserted_count += 1;
        result.upserted_ids.insert(index, id.clone());
    }
}

fn merge_bulk(total: &mut BulkWriteResult, partial: BulkWriteResult) {
    total.deleted_count += partial.deleted_count;
    total.inserted_count += partial.inserted_count;
    total.matched_count += partial.matched_count;
    total.modified_count += partial.modified_count;
    total.upserted_count += partial.upserted_count;
    total.inserted_ids.extend(partial.inserted_ids);
    total.upserted_ids.extend(partial.upserted_ids);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::into_document;
    use crate::service::client::ClientOptions;
    use crate::service::deployment::{Deployment, ServerInfo};

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    fn collection() -> (Collection, CancellationToken) {
        let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
        (client.database("db").collection("coll"), CancellationToken::new())
    }

    #[test]
    fn test_find_uses_batches_and_get_more() {
        let (coll, cancel) = collection();
        let docs = (1..=5).map(|i| doc(json!({"_id": i}))).collect();
        coll.insert_many(docs, InsertManyOptions::default(), None, &cancel).unwrap();

        let options = FindOptions {
            batch_size: Some(2),
            sort: Some(doc(json!({"_id": 1}))),
            ..FindOptions::default()
        };
        let cursor = coll.find(&Document::new(), options, None, &cancel).unwrap();
        let all = cursor.collect_all(&cancel).unwrap();
        assert_eq!(all.len(), 5);
        assert!(cursor.is_exhausted().unwrap());
    }

    #[test]
    fn test_unordered_insert_many_continues_after_error() {
        let (coll, cancel) = collection();
        let docs = vec![doc(json!({"_id": 1})), doc(json!({"_id": 1})), doc(json!({"_id": 2}))];
        let options = InsertManyOptions {
            ordered: false,
            ..InsertManyOptions::default()
        };
        let err = coll.insert_many(docs, options, None, &cancel).unwrap_err();
        assert_eq!(err.code, Some(11000));
        let count = coll
            .count_documents(&Document::new(), CountOptions::default(), None, &cancel)
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_find_one_and_update_returns_requested_version() {
        let (coll, cancel) = collection();
        coll.insert_one(doc(json!({"_id": 1, "x": 1})), InsertOneOptions::default(), None, &cancel)
            .unwrap();
        let options = FindOneAndModifyOptions {
            return_document: ReturnDocument::After,
            ..FindOneAndModifyOptions::default()
        };
        let updated = coll
            .find_one_and_update(&doc(json!({"_id": 1})), json!({"$inc": {"x": 1}}), options, None, &cancel)
            .unwrap();
        assert_eq!(updated.unwrap()["x"], json!(2));
    }

    #[test]
    fn test_bulk_write_counts() {
        let (coll, cancel) = collection();
        let models = vec![
            WriteModel::InsertOne { document: doc(json!({"_id": 1, "x": 1})) },
            WriteModel::InsertOne { document: doc(json!({"_id": 2, "x": 2})) },
            WriteModel::UpdateOne {
                filter: doc(json!({"_id": 1})),
                update: json!({"$set": {"x": 10}}),
                upsert: false,
            },
            WriteModel::UpdateOne {
                filter: doc(json!({"_id": 3})),
                update: json!({"$set": {"x": 3}}),
                upsert: true,
            },
            WriteModel::DeleteOne { filter: doc(json!({"_id": 2})) },
        ];
        let result = coll.bulk_write(models, BulkWriteOptions::default(), None, &cancel).unwrap();
        assert_eq!(result.inserted_count, 2);
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.upserted_count, 1);
        assert_eq!(result.upserted_ids.get(&3), Some(&json!(3)));
        assert_eq!(result.deleted_count, 1);
    }

    #[test]
    fn test_distinct_flattens_arrays() {
        let (coll, cancel) = collection();
        let docs = vec![doc(json!({"tags": ["a", "b"]})), doc(json!({"tags": "a"})), doc(json!({"tags": "c"}))];
        coll.insert_many(docs, InsertManyOptions::default(), None, &cancel).unwrap();
        let values = coll.distinct("tags", &Document::new(), None, &cancel).unwrap();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }
}
