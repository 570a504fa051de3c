use super::change_stream::{ChangeStream, ChangeStreamOptions, StreamScope};
use super::client::{Client, CommandRequest, RetryKind};
use super::collection::Collection;
use super::cursor::{Cursor, cursor_reply};
use super::error::{ServiceError, ServiceResult};
use super::query::{matches_filter, run_pipeline};
use super::session::ClientSession;
use super::store::Namespace;
use crate::core::document::{Document, DocumentExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Database {
    client: Client,
    name: String,
    read_concern: Option<Document>,
    write_concern: Option<Document>,
}

fn ok_reply() -> Document {
    let mut reply = Document::new();
    reply.insert("ok".to_string(), Value::from(1));
    reply
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            read_concern: client.options().read_concern.clone(),
            write_concern: client.options().write_concern.clone(),
            client,
            name: name.to_string(),
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(
            self.client.clone(),
            Namespace::new(self.name.clone(), name),
            self.read_concern.clone(),
            self.write_concern.clone(),
        )
    }

    pub fn create_collection(
        &self,
        name: &str,
        options: Document,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let mut command = Document::new();
        command.insert("create".to_string(), Value::String(name.to_string()));
        command.extend(options.clone());
        let ns = Namespace::new(self.name.clone(), name);
        let request = CommandRequest::new(&self.name, "create", command).session(session);
        self.client.execute(request, cancel, |ctx| {
            ctx.write(|ws| ws.create_collection(&ns, options.clone()))?;
            Ok(((), ok_reply()))
        })
    }

    pub fn drop_collection(
        &self,
        name: &str,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        self.collection(name).drop(session, cancel)
    }

    pub fn list_collections(
        &self,
        filter: Option<&Document>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Document>> {
        let mut command = Document::new();
        command.insert("listCollections".to_string(), Value::from(1));
        if let Some(filter) = filter {
            command.insert("filter".to_string(), Value::Object(filter.clone()));
        }
        command.insert("cursor".to_string(), json!({}));
        let request = CommandRequest::new(&self.name, "listCollections", command)
            .session(session)
            .retry(RetryKind::Read);
        let reply_ns = Namespace::new(self.name.clone(), "$cmd.listCollections");
        self.client.execute(request, cancel, |ctx| {
            let state = ctx.read()?;
            let mut collections = Vec::new();
            for coll in state.collection_names(&self.name) {
                let options = state
                    .collection(&Namespace::new(self.name.clone(), coll.clone()))
                    .map(|data| data.options.clone())
                    .unwrap_or_default();
                let entry = json!({
                    "name": coll,
                    "type": "collection",
                    "options": options,
                    "info": {"readOnly": false}
                });
                let entry = entry.as_object().cloned().unwrap_or_default();
                if let Some(filter) = filter {
                    if !matches_filter(&entry, filter)? {
                        continue;
                    }
                }
                collections.push(entry);
            }
            let reply = cursor_reply(&reply_ns, 0, "firstBatch", &collections);
            Ok((collections, reply))
        })
    }

    pub fn list_collection_names(
        &self,
        filter: Option<&Document>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<String>> {
        Ok(self
            .list_collections(filter, session, cancel)?
            .iter()
            .filter_map(|entry| entry.get_str("name").map(String::from))
            .collect())
    }

    /// Database-level aggregation; the pipeline must start with `$documents`.
    pub fn aggregate(
        &self,
        pipeline: Vec<Document>,
        batch_size: Option<usize>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Cursor> {
        let mut command = Document::new();
        command.insert("aggregate".to_string(), Value::from(1));
        command.insert(
            "pipeline".to_string(),
            Value::Array(pipeline.iter().cloned().map(Value::Object).collect()),
        );
        command.insert("cursor".to_string(), json!({}));
        let ns = Namespace::new(self.name.clone(), "$cmd.aggregate");
        let request = CommandRequest::new(&self.name, "aggregate", command)
            .session(session)
            .retry(RetryKind::Read);
        let (first, id) = self.client.execute(request, cancel, |ctx| {
            let Some((source, rest)) = pipeline.split_first() else {
                return Err(ServiceError::bad_value("Database aggregation requires a pipeline"));
            };
            let documents = source
                .get_array("$documents")
                .ok_or_else(|| {
                    ServiceError::bad_value("Database aggregation must start with $documents")
                })?
                .iter()
                .filter_map(|doc| doc.as_object().cloned())
                .collect();
            let documents = run_pipeline(documents, rest)?;
            let (first, id) = ctx.deployment().open_cursor(ns.clone(), documents, batch_size)?;
            let reply = cursor_reply(&ns, id, "firstBatch", &first);
            Ok(((first, id), reply))
        })?;
        Ok(Cursor::new(self.client.clone(), ns, first, id, batch_size, session.cloned()))
    }

    pub fn drop(
        &self,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let mut command = Document::new();
        command.insert("dropDatabase".to_string(), Value::from(1));
        self.run_command(command, session, cancel).map(|_| ())
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
            StreamScope::Database(self.name.clone()),
            pipeline,
            options,
            session,
            cancel,
        )
    }

    /// Generic command entry point; the first key names the command.
    pub fn run_command(
        &self,
        command: Document,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Document> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| ServiceError::invalid_argument("Command document must not be empty"))?;
        let request = CommandRequest::new(&self.name, &name, command.clone()).session(session);
        self.client.execute(request, cancel, |ctx| {
            let deployment = ctx.deployment();
            let info = deployment.info();
            let reply = match name.as_str() {
                "ping" => ok_reply(),
                "hello" | "isMaster" | "ismaster" => {
                    let mut reply = json!({
                        "isWritablePrimary": true,
                        "ismaster": true,
                        "maxWireVersion": 21,
                        "ok": 1
                    });
                    if info.topology.as_str().contains("replicaset") {
                        reply["setName"] = json!("rs0");
                    }
                    if info.topology.as_str().starts_with("sharded") {
                        reply["msg"] = json!("isdbgrid");
                    }
                    reply.as_object().cloned().unwrap_or_default()
                }
                "buildInfo" | "buildinfo" => {
                    let version = &info.version;
                    json!({
                        "version": version.to_string(),
                        "versionArray": [version.major, version.minor, version.patch, 0],
                        "ok": 1
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
                }
                "count" => {
                    let coll = command.get_str("count").unwrap_or_default();
                    let ns = Namespace::new(self.name.clone(), coll);
                    let filter = command.get_document("query").cloned().unwrap_or_default();
                    let state = ctx.read()?;
                    let mut n = 0;
                    for doc in state.all_documents(&ns) {
                        if matches_filter(&doc, &filter)? {
                            n += 1;
                        }
                    }
                    json!({"n": n, "ok": 1}).as_object().cloned().unwrap_or_default()
                }
                "dropDatabase" => {
                    ctx.write(|ws| {
                        ws.drop_database(&self.name);
                        Ok(())
                    })?;
                    ok_reply()
                }
                "configureFailPoint" => {
                    deployment.configure_fail_point(&command)?;
                    ok_reply()
                }
                "killAllSessions" => {
                    deployment.kill_all_sessions();
                    ok_reply()
                }
                other => {
                    return Err(ServiceError::command(
                        59,
                        "CommandNotFound",
                        format!("no such command: '{}'", other),
                    ));
                }
            };
            Ok((reply.clone(), reply))
        })
    }

    async_pair!(create_collection_async => create_collection(
        name: &str,
        options: Document,
        session: Option<&ClientSession>
    ) -> ServiceResult<()>);
    async_pair!(drop_collection_async => drop_collection(
        name: &str,
        session: Option<&ClientSession>
    ) -> ServiceResult<()>);
    async_pair!(list_collections_async => list_collections(
        filter: Option<&Document>,
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<Document>>);
    async_pair!(list_collection_names_async => list_collection_names(
        filter: Option<&Document>,
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<String>>);
    async_pair!(aggregate_async => aggregate(
        pipeline: Vec<Document>,
        batch_size: Option<usize>,
        session: Option<&ClientSession>
    ) -> ServiceResult<Cursor>);
    async_pair!(drop_async => drop(session: Option<&ClientSession>) -> ServiceResult<()>);
    async_pair!(watch_async => watch(
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<ChangeStream>);
    async_pair!(run_command_async => run_command(
        command: Document,
        session: Option<&ClientSession>
    ) -> ServiceResult<Document>);
}
