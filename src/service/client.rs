// ============================================================================
// Client & Command Pipeline
// ============================================================================
//
// Every command goes through `Client::execute`:
//
//   check-out -> commandStarted -> fail point -> body -> succeeded/failed -> check-in
//
// with a single retry for retryable reads and writes outside transactions.
//
// ============================================================================

use super::change_stream::{ChangeStream, ChangeStreamOptions, StreamScope};
use super::database::Database;
use super::deployment::Deployment;
use super::error::{
    ErrorKind, ServiceError, ServiceResult, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use super::events::{EventListener, ServiceEvent};
use super::session::{ClientSession, SessionOptions};
use super::store::{StoreState, Workspace};
use crate::core::Document;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    pub app_name: Option<String>,
    pub retry_reads: bool,
    pub retry_writes: bool,
    pub read_concern: Option<Document>,
    pub write_concern: Option<Document>,
    pub max_pool_size: Option<u32>,
    pub server_api: Option<Document>,
    pub load_balanced: bool,
    pub listeners: Vec<Arc<dyn EventListener>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            app_name: None,
            retry_reads: true,
            retry_writes: true,
            read_concern: None,
            write_concern: None,
            max_pool_size: None,
            server_api: None,
            load_balanced: false,
            listeners: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn app_name(mut self, app_name: &str) -> Self {
        self.app_name = Some(app_name.to_string());
        self
    }

    pub fn retry_reads(mut self, retry: bool) -> Self {
        self.retry_reads = retry;
        self
    }

    pub fn retry_writes(mut self, retry: bool) -> Self {
        self.retry_writes = retry;
        self
    }

    pub fn read_concern(mut self, read_concern: Document) -> Self {
        self.read_concern = Some(read_concern);
        self
    }

    pub fn write_concern(mut self, write_concern: Document) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn server_api(mut self, server_api: Document) -> Self {
        self.server_api = Some(server_api);
        self
    }

    pub fn load_balanced(mut self, load_balanced: bool) -> Self {
        self.load_balanced = load_balanced;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    None,
    Read,
    Write,
}

/// One command as issued by a handle.
pub struct CommandRequest<'a> {
    pub database: &'a str,
    pub name: &'a str,
    pub command: Document,
    pub session: Option<&'a ClientSession>,
    pub retry: RetryKind,
}

impl<'a> CommandRequest<'a> {
    pub fn new(database: &'a str, name: &'a str, command: Document) -> Self {
        Self {
            database,
            name,
            command,
            session: None,
            retry: RetryKind::None,
        }
    }

    pub fn session(mut self, session: Option<&'a ClientSession>) -> Self {
        self.session = session;
        self
    }

    pub fn retry(mut self, retry: RetryKind) -> Self {
        self.retry = retry;
        self
    }
}

/// Where a command body reads from and writes to.
pub struct CommandContext<'a> {
    deployment: &'a Deployment,
    session: Option<&'a ClientSession>,
}

impl CommandContext<'_> {
    pub fn deployment(&self) -> &Deployment {
        self.deployment
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session
    }

    /// The store as seen by this command (a transaction sees its own writes).
    pub fn read(&self) -> ServiceResult<StoreState> {
        if let Some(session) = self.session {
            if let Some(state) = session.transaction_view(self.deployment)? {
                return Ok(state);
            }
        }
        self.deployment.snapshot()
    }

    pub fn write<T>(&self, f: impl FnOnce(&mut Workspace) -> ServiceResult<T>) -> ServiceResult<T> {
        if let Some(session) = self.session {
            if session.in_transaction()? {
                return session.transaction_write(self.deployment, f);
            }
        }
        self.deployment.publish(f)
    }
}

pub(crate) struct ClientInner {
    deployment: Arc<Deployment>,
    options: ClientOptions,
    closed: AtomicBool,
    checked_out: AtomicUsize,
    idle: Mutex<Vec<u64>>,
    implicit_lsid: Document,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Fresh logical session id, `{"id": <UUID binary>}`.
pub(crate) fn new_lsid() -> Document {
    let uuid = uuid::Uuid::new_v4();
    let binary = json!({"$binary": {"base64": STANDARD.encode(uuid.as_bytes()), "subType": "04"}});
    let mut lsid = Document::new();
    lsid.insert("id".to_string(), binary);
    lsid
}

impl Client {
    pub fn new(deployment: Arc<Deployment>, options: ClientOptions) -> Self {
        let client = Self {
            inner: Arc::new(ClientInner {
                deployment,
                options,
                closed: AtomicBool::new(false),
                checked_out: AtomicUsize::new(0),
                idle: Mutex::new(Vec::new()),
                implicit_lsid: new_lsid(),
            }),
        };
        client.emit(ServiceEvent::PoolCreated);
        client.emit(ServiceEvent::PoolReady);
        client
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.inner.deployment
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn same_client(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn checked_out_connections(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    pub fn start_session(&self, options: SessionOptions) -> ServiceResult<ClientSession> {
        if self.is_closed() {
            return Err(ServiceError::closed("client"));
        }
        Ok(ClientSession::new(self.clone(), options))
    }

    pub(crate) fn emit(&self, event: ServiceEvent) {
        for listener in &self.inner.options.listeners {
            listener.handle(&event);
        }
    }

    // ------------------------------------------------------------------
    // Connection pool
    // ------------------------------------------------------------------

    fn check_out(&self) -> u64 {
        self.emit(ServiceEvent::ConnectionCheckOutStarted);
        let reused = self.inner.idle.lock().ok().and_then(|mut idle| idle.pop());
        let connection_id = match reused {
            Some(id) => id,
            None => {
                let id = self.inner.deployment.next_connection_id();
                self.emit(ServiceEvent::ConnectionCreated { connection_id: id });
                self.emit(ServiceEvent::ConnectionReady { connection_id: id });
                id
            }
        };
        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        self.emit(ServiceEvent::ConnectionCheckedOut { connection_id });
        connection_id
    }

    fn check_in(&self, connection_id: u64, broken: bool) {
        self.inner.checked_out.fetch_sub(1, Ordering::SeqCst);
        if broken {
            self.emit(ServiceEvent::ConnectionClosed {
                connection_id,
                reason: "error".to_string(),
            });
            self.emit(ServiceEvent::PoolCleared);
            return;
        }
        self.emit(ServiceEvent::ConnectionCheckedIn { connection_id });
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.push(connection_id);
        }
    }

    /// Close the pool. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let idle: Vec<u64> = self
            .inner
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for connection_id in idle {
            self.emit(ServiceEvent::ConnectionClosed {
                connection_id,
                reason: "poolClosed".to_string(),
            });
        }
        self.emit(ServiceEvent::PoolClosed);
        debug!(app_name = ?self.inner.options.app_name, "Client closed");
    }

    // ------------------------------------------------------------------
    // Command pipeline
    // ------------------------------------------------------------------

    /// Run a command. `body` returns the operation value plus the server reply
    /// reported in the succeeded event.
    pub fn execute<T>(
        &self,
        request: CommandRequest<'_>,
        cancel: &CancellationToken,
        mut body: impl FnMut(&CommandContext<'_>) -> ServiceResult<(T, Document)>,
    ) -> ServiceResult<T> {
        if self.is_closed() {
            return Err(ServiceError::closed("client"));
        }
        if let Some(session) = request.session {
            if !self.same_client(session.client()) {
                return Err(ServiceError::invalid_argument(
                    "Session was not created by the client executing the operation",
                ));
            }
        }

        let in_transaction = match request.session {
            Some(session) => session.in_transaction()?,
            None => false,
        };
        let retryable = !in_transaction
            && match request.retry {
                RetryKind::Read => self.inner.options.retry_reads,
                RetryKind::Write => self.inner.options.retry_writes,
                RetryKind::None => false,
            };

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ServiceError::cancelled());
            }
            match self.execute_once(&request, &mut body) {
                Err(err) if retryable && attempt == 0 && err.is_retryable() => {
                    debug!(command = request.name, error = %err, "Retrying command");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn execute_once<T>(
        &self,
        request: &CommandRequest<'_>,
        body: &mut impl FnMut(&CommandContext<'_>) -> ServiceResult<(T, Document)>,
    ) -> ServiceResult<T> {
        let deployment = &self.inner.deployment;

        let mut command = request.command.clone();
        command.insert("$db".to_string(), Value::String(request.database.to_string()));
        let lsid = match request.session {
            Some(session) => {
                session.ensure_usable()?;
                session.lsid().clone()
            }
            None => self.inner.implicit_lsid.clone(),
        };
        command.insert("lsid".to_string(), Value::Object(lsid));
        if let Some(session) = request.session {
            command.extend(session.command_fields(request.name, deployment)?);
        }
        if let Some(api) = &self.inner.options.server_api {
            if let Some(version) = api.get("version") {
                command.insert("apiVersion".to_string(), version.clone());
            }
        }

        let connection_id = self.check_out();
        let request_id = deployment.next_request_id();
        trace!(command = request.name, request_id, "Command started");
        self.emit(ServiceEvent::CommandStarted {
            command_name: request.name.to_string(),
            database_name: request.database.to_string(),
            command,
            request_id,
            connection_id,
        });

        let started = Instant::now();
        let app_name = self.inner.options.app_name.as_deref();
        let hit = deployment.check_fail_point(request.name, app_name)?;
        let broken = hit.as_ref().is_some_and(|hit| hit.close_connection);
        let outcome = match hit {
            Some(hit) => Err(hit.error),
            None => {
                let context = CommandContext {
                    deployment,
                    session: request.session,
                };
                body(&context)
            }
        };
        let duration = started.elapsed();

        let result = match outcome {
            Ok((value, reply)) => {
                self.emit(ServiceEvent::CommandSucceeded {
                    command_name: request.name.to_string(),
                    database_name: request.database.to_string(),
                    reply,
                    request_id,
                    duration,
                });
                Ok(value)
            }
            Err(err) if err.kind == ErrorKind::Write => {
                let reply = json!({
                    "ok": 1,
                    "n": 0,
                    "writeErrors": [{"index": 0, "code": err.code, "errmsg": err.message}]
                });
                self.emit(ServiceEvent::CommandSucceeded {
                    command_name: request.name.to_string(),
                    database_name: request.database.to_string(),
                    reply: reply.as_object().cloned().unwrap_or_default(),
                    request_id,
                    duration,
                });
                Err(err)
            }
            Err(mut err) => {
                if let Some(session) = request.session {
                    if err.is_network() {
                        session.mark_dirty();
                        if request.name == "commitTransaction" {
                            err = err.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                        } else if session.in_transaction()? {
                            err = err.with_label(TRANSIENT_TRANSACTION_ERROR);
                        }
                    } else if request.name == "commitTransaction" && err.is_retryable() {
                        err = err.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                    }
                }
                self.emit(ServiceEvent::CommandFailed {
                    command_name: request.name.to_string(),
                    database_name: request.database.to_string(),
                    failure: err.clone(),
                    request_id,
                    duration,
                });
                Err(err)
            }
        };

        self.check_in(connection_id, broken);
        result
    }

    // ------------------------------------------------------------------
    // Client-level operations
    // ------------------------------------------------------------------

    pub fn list_databases(
        &self,
        filter: Option<&Document>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Document>> {
        let mut command = Document::new();
        command.insert("listDatabases".to_string(), Value::from(1));
        if let Some(filter) = filter {
            command.insert("filter".to_string(), Value::Object(filter.clone()));
        }
        let request = CommandRequest::new("admin", "listDatabases", command)
            .session(session)
            .retry(RetryKind::Read);
        self.execute(request, cancel, |ctx| {
            let state = ctx.read()?;
            let mut databases = Vec::new();
            for name in state.database_names() {
                let mut entry = Document::new();
                entry.insert("name".to_string(), Value::String(name.clone()));
                let size = state.database_size(&name);
                entry.insert("sizeOnDisk".to_string(), Value::from(size as i64));
                entry.insert("empty".to_string(), Value::Bool(size == 0));
                if let Some(filter) = filter {
                    if !super::query::matches_filter(&entry, filter)? {
                        continue;
                    }
                }
                databases.push(entry);
            }
            let reply = json!({"databases": databases.clone(), "ok": 1});
            Ok((databases, reply.as_object().cloned().unwrap_or_default()))
        })
    }

    pub fn list_database_names(
        &self,
        filter: Option<&Document>,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<String>> {
        Ok(self
            .list_databases(filter, session, cancel)?
            .into_iter()
            .filter_map(|db| db.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    pub fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>,
        cancel: &CancellationToken,
    ) -> ServiceResult<ChangeStream> {
        ChangeStream::open(
            self.clone(),
            StreamScope::Deployment,
            pipeline,
            options,
            session,
            cancel,
        )
    }

    async_pair!(list_databases_async => list_databases(
        filter: Option<&Document>,
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<Document>>);
    async_pair!(list_database_names_async => list_database_names(
        filter: Option<&Document>,
        session: Option<&ClientSession>
    ) -> ServiceResult<Vec<String>>);
    async_pair!(watch_async => watch(
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>
    ) -> ServiceResult<ChangeStream>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::deployment::ServerInfo;
    use std::sync::RwLock;

    #[derive(Default)]
    struct Recorder {
        events: RwLock<Vec<ServiceEvent>>,
    }

    impl EventListener for Recorder {
        fn handle(&self, event: &ServiceEvent) {
            self.events.write().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_pipeline_emits_events_and_reuses_connections() {
        let recorder = Arc::new(Recorder::default());
        let client = Client::new(
            Deployment::new(ServerInfo::default()),
            ClientOptions::default().listener(recorder.clone()),
        );
        let cancel = CancellationToken::new();
        client.list_database_names(None, None, &cancel).unwrap();
        client.list_database_names(None, None, &cancel).unwrap();
        assert_eq!(client.checked_out_connections(), 0);

        let names: Vec<&str> = recorder
            .events
            .read()
            .unwrap()
            .iter()
            .map(|e| e.type_name())
            .collect();
        let created = names.iter().filter(|n| **n == "connectionCreatedEvent").count();
        let started = names.iter().filter(|n| **n == "commandStartedEvent").count();
        assert_eq!((created, started), (1, 2));
    }

    #[test]
    fn test_retryable_read_retries_once() {
        let deployment = Deployment::new(ServerInfo::default());
        let client = Client::new(deployment.clone(), ClientOptions::default());
        let mut command = Document::new();
        command.insert("configureFailPoint".to_string(), json!("failCommand"));
        command.insert("mode".to_string(), json!({"times": 1}));
        command.insert("data".to_string(), json!({"failCommands": ["listDatabases"], "closeConnection": true}));
        deployment.configure_fail_point(&command).unwrap();

        let cancel = CancellationToken::new();
        assert!(client.list_databases(None, None, &cancel).is_ok());

        deployment.configure_fail_point(&command).unwrap();
        let no_retry = Client::new(deployment, ClientOptions::default().retry_reads(false));
        let err = no_retry.list_databases(None, None, &cancel).unwrap_err();
        assert!(err.is_network());
    }

    #[test]
    fn test_closed_client_rejects_commands() {
        let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
        client.close();
        client.close();
        let err = client
            .list_databases(None, None, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);
    }
}
