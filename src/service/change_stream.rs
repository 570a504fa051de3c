// ============================================================================
// Change Streams
// ============================================================================
//
// Committed writes are appended to a deployment-wide `ChangeLog`. A stream
// remembers its position in the log and turns entries into change events
// on each `getMore`.
//
// ============================================================================

use super::client::{Client, CommandRequest, RetryKind};
use super::cursor::cursor_reply;
use super::error::{ServiceError, ServiceResult};
use super::query::run_pipeline;
use super::session::ClientSession;
use super::store::{ChangeKind, ChangeRecord, Namespace};
use crate::core::Document;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const ALLOWED_STAGES: &[&str] = &["$match", "$project", "$addFields", "$set", "$unset"];

#[derive(Debug, Clone)]
pub struct LoggedChange {
    pub sequence: u64,
    pub record: ChangeRecord,
}

/// Append-only log of committed changes with blocking and async waiters.
pub struct ChangeLog {
    entries: Mutex<Vec<LoggedChange>>,
    appended: Condvar,
    notify: Notify,
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            appended: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn entries(&self) -> ServiceResult<MutexGuard<'_, Vec<LoggedChange>>> {
        self.entries
            .lock()
            .map_err(|err| {
                ServiceError::invalid_argument(format!("Change log lock poisoned: {}", err))
            })
    }

    pub fn append(&self, records: Vec<ChangeRecord>) {
        if records.is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            for record in records {
                let sequence = entries.len() as u64;
                entries.push(LoggedChange { sequence, record });
            }
        }
        self.appended.notify_all();
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> ServiceResult<u64> {
        Ok(self.entries()?.len() as u64)
    }

    pub fn is_empty(&self) -> ServiceResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_from(&self, position: u64) -> ServiceResult<Vec<LoggedChange>> {
        let entries = self.entries()?;
        Ok(entries.iter().skip(position as usize).cloned().collect())
    }

    /// Block until the log grows past `position`. Returns false on timeout.
    pub fn wait_blocking(&self, position: u64, timeout: Duration) -> ServiceResult<bool> {
        let entries = self.entries()?;
        let (entries, _) = self
            .appended
            .wait_timeout_while(entries, timeout, |entries| entries.len() as u64 <= position)
            .map_err(|err| {
                ServiceError::invalid_argument(format!("Change log lock poisoned: {}", err))
            })?;
        Ok(entries.len() as u64 > position)
    }

    pub async fn wait_async(&self, position: u64, timeout: Duration) -> ServiceResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len()? > position {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

// ============================================================================
// Stream handle
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StreamScope {
    Deployment,
    Database(String),
    Collection(Namespace),
}

impl StreamScope {
    fn covers(&self, namespace: &Namespace) -> bool {
        match self {
            StreamScope::Deployment => true,
            StreamScope::Database(db) => &namespace.db == db,
            StreamScope::Collection(ns) => ns == namespace,
        }
    }

    fn target(&self) -> (String, Value) {
        match self {
            StreamScope::Deployment => ("admin".to_string(), Value::from(1)),
            StreamScope::Database(db) => (db.clone(), Value::from(1)),
            StreamScope::Collection(ns) => (ns.db.clone(), Value::String(ns.coll.clone())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    pub full_document: Option<String>,
    pub full_document_before_change: Option<String>,
    pub batch_size: Option<usize>,
    pub max_await_time_ms: Option<u64>,
    pub show_expanded_events: Option<bool>,
    pub comment: Option<Value>,
}

struct StreamState {
    position: u64,
    buffer: VecDeque<Document>,
    closed: bool,
}

struct StreamInner {
    client: Client,
    scope: StreamScope,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    session: Option<ClientSession>,
    cursor_id: i64,
    state: Mutex<StreamState>,
}

/// Live change-notification iterator. Clones share position.
#[derive(Clone)]
pub struct ChangeStream {
    inner: Arc<StreamInner>,
}

fn change_event(entry: &LoggedChange, options: &ChangeStreamOptions) -> Document {
    let record = &entry.record;
    let mut event = Document::new();
    event.insert("_id".to_string(), json!({"_data": hex::encode(entry.sequence.to_be_bytes())}));
    event.insert("operationType".to_string(), Value::String(record.kind.as_str().to_string()));
    event.insert(
        "ns".to_string(),
        json!({"db": record.namespace.db, "coll": record.namespace.coll}),
    );
    if let Some(id) = &record.document_id {
        event.insert("documentKey".to_string(), json!({"_id": id}));
    }
    let include_full = match record.kind {
        ChangeKind::Insert | ChangeKind::Replace => true,
        ChangeKind::Update => options.full_document.as_deref() == Some("updateLookup"),
        _ => false,
    };
    if include_full {
        if let Some(full) = &record.full_document {
            event.insert("fullDocument".to_string(), Value::Object(full.clone()));
        }
    }
    if let Some(description) = &record.update_description {
        event.insert("updateDescription".to_string(), Value::Object(description.clone()));
    }
    event
}

impl ChangeStream {
    pub(crate) fn open(
        client: Client,
        scope: StreamScope,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Self> {
        for stage in &pipeline {
            let name = stage.keys().next().map(String::as_str).unwrap_or_default();
            if !ALLOWED_STAGES.contains(&name) {
                return Err(ServiceError::command(
                    40324,
                    "Location40324",
                    format!("Unrecognized pipeline stage name: '{}'", name),
                ));
            }
        }

        let (database, aggregate_target) = scope.target();
        let mut change_stream_stage = Document::new();
        if let Some(full_document) = &options.full_document {
            change_stream_stage
                .insert("fullDocument".to_string(), Value::String(full_document.clone()));
        }
        if scope == StreamScope::Deployment {
            change_stream_stage.insert("allChangesForCluster".to_string(), Value::Bool(true));
        }
        let mut full_pipeline = vec![json!({"$changeStream": change_stream_stage})];
        full_pipeline.extend(pipeline.iter().cloned().map(Value::Object));

        let mut command = Document::new();
        command.insert("aggregate".to_string(), aggregate_target);
        command.insert("pipeline".to_string(), Value::Array(full_pipeline));
        command.insert("cursor".to_string(), json!({}));
        if let Some(comment) = &options.comment {
            command.insert("comment".to_string(), comment.clone());
        }

        let request = CommandRequest::new(&database, "aggregate", command)
            .session(session)
            .retry(RetryKind::Read);
        let reply_ns = match &scope {
            StreamScope::Collection(ns) => ns.clone(),
            _ => Namespace::new(database.clone(), "$cmd.aggregate"),
        };
        let (position, cursor_id) = client.execute(request, cancel, |ctx| {
            let position = ctx.deployment().change_log().len()?;
            let cursor_id = ctx.deployment().next_request_id() + 1_000_000;
            Ok(((position, cursor_id), cursor_reply(&reply_ns, cursor_id, "firstBatch", &[])))
        })?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                client,
                scope,
                pipeline,
                options,
                session: session.cloned(),
                cursor_id,
                state: Mutex::new(StreamState {
                    position,
                    buffer: VecDeque::new(),
                    closed: false,
                }),
            }),
        })
    }

    fn state(&self) -> ServiceResult<MutexGuard<'_, StreamState>> {
        self.inner
            .state
            .lock()
            .map_err(|err| {
                ServiceError::invalid_argument(format!("Change stream lock poisoned: {}", err))
            })
    }

    fn position(&self) -> ServiceResult<u64> {
        Ok(self.state()?.position)
    }

    /// One `getMore`: return a buffered or newly observed event, without waiting.
    pub fn try_next(&self, cancel: &CancellationToken) -> ServiceResult<Option<Document>> {
        let mut state = self.state()?;
        if state.closed {
            return Err(ServiceError::closed("change stream"));
        }
        if let Some(event) = state.buffer.pop_front() {
            return Ok(Some(event));
        }

        let (database, target) = self.inner.scope.target();
        let mut command = Document::new();
        command.insert("getMore".to_string(), Value::from(self.inner.cursor_id));
        command.insert("collection".to_string(), target);
        if let Some(size) = self.inner.options.batch_size {
            command.insert("batchSize".to_string(), Value::from(size as u64));
        }
        let position = state.position;
        let request = CommandRequest::new(&database, "getMore", command)
            .session(self.inner.session.as_ref());
        let (events, next_position) = self.inner.client.execute(request, cancel, |ctx| {
            let entries = ctx.deployment().change_log().read_from(position)?;
            let next_position = position + entries.len() as u64;
            let mut events = Vec::new();
            for entry in entries.iter().filter(|e| self.inner.scope.covers(&e.record.namespace)) {
                let event = change_event(entry, &self.inner.options);
                events.extend(run_pipeline(vec![event], &self.inner.pipeline)?);
            }
            let ns = Namespace::new(database.clone(), "$cmd.aggregate");
            let reply = cursor_reply(&ns, self.inner.cursor_id, "nextBatch", &events);
            Ok(((events, next_position), reply))
        })?;
        state.position = next_position;
        state.buffer.extend(events);
        Ok(state.buffer.pop_front())
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_next(cancel)? {
                return Ok(Some(event));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || cancel.is_cancelled() {
                return Ok(None);
            }
            let change_log = self.inner.client.deployment().change_log().clone();
            change_log.wait_blocking(self.position()?, remaining)?;
        }
    }

    pub async fn next_timeout_async(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let deadline = Instant::now() + timeout;
        loop {
            super::yield_checked(cancel).await?;
            if let Some(event) = self.try_next(cancel)? {
                return Ok(Some(event));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let change_log = self.inner.client.deployment().change_log().clone();
            let position = self.position()?;
            tokio::select! {
                waited = change_log.wait_async(position, remaining) => { waited?; }
                _ = cancel.cancelled() => return Err(ServiceError::cancelled()),
            }
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        {
            let mut state = self.state()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.buffer.clear();
        }
        let (database, target) = self.inner.scope.target();
        let mut command = Document::new();
        command.insert("killCursors".to_string(), target);
        command.insert("cursors".to_string(), json!([self.inner.cursor_id]));
        let request = CommandRequest::new(&database, "killCursors", command)
            .session(self.inner.session.as_ref());
        let cursor_id = self.inner.cursor_id;
        self.inner.client.execute(request, cancel, |_| {
            let reply = json!({"cursorsKilled": [cursor_id], "ok": 1});
            Ok(((), reply.as_object().cloned().unwrap_or_default()))
        })
    }

    async_pair!(try_next_async => try_next() -> ServiceResult<Option<Document>>);
    async_pair!(close_async => close() -> ServiceResult<()>);
}
