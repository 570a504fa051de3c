use super::client::{Client, CommandRequest, RetryKind};
use super::error::{ServiceError, ServiceResult};
use super::session::ClientSession;
use super::store::Namespace;
use crate::core::Document;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct CursorState {
    buffer: VecDeque<Document>,
    cursor_id: i64,
    closed: bool,
}

struct CursorInner {
    client: Client,
    namespace: Namespace,
    batch_size: Option<usize>,
    session: Option<ClientSession>,
    state: Mutex<CursorState>,
}

/// Live server cursor. Further batches are fetched with `getMore`.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<CursorInner>,
}

pub(crate) fn cursor_reply(
    namespace: &Namespace,
    id: i64,
    batch_key: &str,
    batch: &[Document],
) -> Document {
    let mut cursor = Document::new();
    cursor.insert(
        batch_key.to_string(),
        Value::Array(batch.iter().cloned().map(Value::Object).collect()),
    );
    cursor.insert("id".to_string(), Value::from(id));
    cursor.insert("ns".to_string(), Value::String(namespace.to_string()));
    let mut reply = Document::new();
    reply.insert("cursor".to_string(), Value::Object(cursor));
    reply.insert("ok".to_string(), Value::from(1));
    reply
}

impl Cursor {
    pub(crate) fn new(
        client: Client,
        namespace: Namespace,
        first_batch: Vec<Document>,
        cursor_id: i64,
        batch_size: Option<usize>,
        session: Option<ClientSession>,
    ) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                client,
                namespace,
                batch_size,
                session,
                state: Mutex::new(CursorState {
                    buffer: first_batch.into(),
                    cursor_id,
                    closed: false,
                }),
            }),
        }
    }

    fn state(&self) -> ServiceResult<MutexGuard<'_, CursorState>> {
        self.inner
            .state
            .lock()
            .map_err(|err| ServiceError::invalid_argument(format!("Cursor lock poisoned: {}", err)))
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// True once the server cursor is closed and the local buffer is drained.
    pub fn is_exhausted(&self) -> ServiceResult<bool> {
        let state = self.state()?;
        Ok(state.closed || (state.cursor_id == 0 && state.buffer.is_empty()))
    }

    pub fn try_next(&self, cancel: &CancellationToken) -> ServiceResult<Option<Document>> {
        let mut state = self.state()?;
        if state.closed {
            return Err(ServiceError::closed("cursor"));
        }
        if state.buffer.is_empty() && state.cursor_id != 0 {
            let (batch, next_id) = self.get_more(state.cursor_id, cancel)?;
            state.cursor_id = next_id;
            state.buffer.extend(batch);
        }
        Ok(state.buffer.pop_front())
    }

    fn get_more(
        &self,
        cursor_id: i64,
        cancel: &CancellationToken,
    ) -> ServiceResult<(Vec<Document>, i64)> {
        let mut command = Document::new();
        command.insert("getMore".to_string(), Value::from(cursor_id));
        command.insert("collection".to_string(), Value::String(self.inner.namespace.coll.clone()));
        if let Some(size) = self.inner.batch_size {
            command.insert("batchSize".to_string(), Value::from(size as u64));
        }
        let namespace = &self.inner.namespace;
        let request = CommandRequest::new(&namespace.db, "getMore", command)
            .session(self.inner.session.as_ref())
            .retry(RetryKind::None);
        self.inner.client.execute(request, cancel, |ctx| {
            let (batch, next_id) = ctx.deployment().get_more(cursor_id, self.inner.batch_size)?;
            let reply = cursor_reply(namespace, next_id, "nextBatch", &batch);
            Ok(((batch, next_id), reply))
        })
    }

    /// Drain every remaining document.
    pub fn collect_all(&self, cancel: &CancellationToken) -> ServiceResult<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(doc) = self.try_next(cancel)? {
            documents.push(doc);
        }
        Ok(documents)
    }

    /// Close the cursor, killing the server cursor if it is still open. Idempotent.
    pub fn close(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let cursor_id = {
            let mut state = self.state()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.buffer.clear();
            std::mem::take(&mut state.cursor_id)
        };
        if cursor_id == 0 {
            return Ok(());
        }
        let mut command = Document::new();
        command.insert("killCursors".to_string(), Value::String(self.inner.namespace.coll.clone()));
        command.insert("cursors".to_string(), json!([cursor_id]));
        let request = CommandRequest::new(&self.inner.namespace.db, "killCursors", command)
            .session(self.inner.session.as_ref());
        self.inner.client.execute(request, cancel, |ctx| {
            ctx.deployment().kill_cursor(cursor_id)?;
            let reply = json!({"cursorsKilled": [cursor_id], "ok": 1});
            Ok(((), reply.as_object().cloned().unwrap_or_default()))
        })
    }

    async_pair!(try_next_async => try_next() -> ServiceResult<Option<Document>>);
    async_pair!(collect_all_async => collect_all() -> ServiceResult<Vec<Document>>);
    async_pair!(close_async => close() -> ServiceResult<()>);
}
