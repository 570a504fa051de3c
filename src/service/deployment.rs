// ============================================================================
// In-Memory Deployment
// ============================================================================
//
// Shared server state: the live store, the change log, server-side cursors,
// fail points and the session-kill epoch. Every client connected to the same
// `Deployment` observes the same data.
//
// ============================================================================

use super::change_stream::ChangeLog;
use super::error::{ServiceError, ServiceResult};
use super::store::{Namespace, StoreState, Workspace};
use crate::core::document::{Document, DocumentExt, value_as_i64};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Single,
    ReplicaSet,
    Sharded,
    LoadBalanced,
    ShardedReplicaSet,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Single => "single",
            Topology::ReplicaSet => "replicaset",
            Topology::Sharded => "sharded",
            Topology::LoadBalanced => "load-balanced",
            Topology::ShardedReplicaSet => "sharded-replicaset",
        }
    }
}

impl FromStr for Topology {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Topology::Single),
            "replicaset" => Ok(Topology::ReplicaSet),
            "sharded" => Ok(Topology::Sharded),
            "load-balanced" => Ok(Topology::LoadBalanced),
            "sharded-replicaset" => Ok(Topology::ShardedReplicaSet),
            other => Err(ServiceError::invalid_argument(format!(
                "Unknown topology '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the deployment reports about itself.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: semver::Version,
    pub topology: Topology,
    pub serverless: bool,
    pub auth: bool,
    pub csfle: bool,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: semver::Version::new(7, 0, 0),
            topology: Topology::ReplicaSet,
            serverless: false,
            auth: false,
            csfle: false,
        }
    }
}

impl ServerInfo {
    pub fn version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn serverless(mut self, serverless: bool) -> Self {
        self.serverless = serverless;
        self
    }

    pub fn auth(mut self, auth: bool) -> Self {
        self.auth = auth;
        self
    }

    pub fn csfle(mut self, csfle: bool) -> Self {
        self.csfle = csfle;
        self
    }

    pub fn supports_transactions(&self) -> bool {
        self.topology != Topology::Single
    }
}

// ============================================================================
// Fail points
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum FailPointMode {
    AlwaysOn,
    Times(u64),
    Skip(u64),
}

#[derive(Debug, Clone)]
struct FailCommand {
    mode: FailPointMode,
    commands: Vec<String>,
    error_code: Option<i32>,
    error_labels: Vec<String>,
    close_connection: bool,
    app_name: Option<String>,
}

/// Outcome of a triggered fail point.
#[derive(Debug, Clone)]
pub struct FailPointHit {
    pub error: ServiceError,
    pub close_connection: bool,
}

pub fn code_name(code: i32) -> &'static str {
    match code {
        2 => "BadValue",
        6 => "HostUnreachable",
        7 => "HostNotFound",
        24 => "LockTimeout",
        50 => "MaxTimeMSExpired",
        89 => "NetworkTimeout",
        91 => "ShutdownInProgress",
        112 => "WriteConflict",
        189 => "PrimarySteppedDown",
        251 => "NoSuchTransaction",
        262 => "ExceededTimeLimit",
        9001 => "SocketException",
        10107 => "NotWritablePrimary",
        11600 => "InterruptedAtShutdown",
        11602 => "InterruptedDueToReplStateChange",
        13435 => "NotPrimaryNoSecondaryOk",
        13436 => "NotPrimaryOrSecondary",
        _ => "Unknown",
    }
}

fn parse_fail_command(command: &Document) -> ServiceResult<Option<FailCommand>> {
    let mode = match command.get("mode") {
        Some(Value::String(mode)) if mode == "alwaysOn" => FailPointMode::AlwaysOn,
        Some(Value::String(mode)) if mode == "off" => return Ok(None),
        Some(Value::Object(mode)) => {
            if let Some(times) = mode.get_i64("times") {
                FailPointMode::Times(times.max(0) as u64)
            } else if let Some(skip) = mode.get_i64("skip") {
                FailPointMode::Skip(skip.max(0) as u64)
            } else {
                return Err(ServiceError::bad_value("Unsupported fail point mode"));
            }
        }
        _ => return Err(ServiceError::bad_value("Fail point mode is required")),
    };

    let empty = Document::new();
    let data = command.get_document("data").unwrap_or(&empty);
    let commands = data
        .get_array("failCommands")
        .map(|names| names.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    Ok(Some(FailCommand {
        mode,
        commands,
        error_code: data.get_i64("errorCode").map(|code| code as i32),
        error_labels: data
            .get_array("errorLabels")
            .map(|labels| labels.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default(),
        close_connection: data.get_bool("closeConnection").unwrap_or(false),
        app_name: data.get_str("appName").map(String::from),
    }))
}

// ============================================================================
// Server-side cursors and transactions
// ============================================================================

#[derive(Debug)]
struct ServerCursor {
    namespace: Namespace,
    remaining: VecDeque<Document>,
}

/// Snapshot-isolated transaction state held by a session.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub base: StoreState,
    pub workspace: Workspace,
    pub epoch: u64,
}

// ============================================================================
// Deployment
// ============================================================================

pub struct Deployment {
    info: ServerInfo,
    live: Mutex<StoreState>,
    change_log: Arc<ChangeLog>,
    fail_command: Mutex<Option<FailCommand>>,
    cursors: Mutex<HashMap<i64, ServerCursor>>,
    kill_epoch: AtomicU64,
    request_ids: AtomicI64,
    cursor_ids: AtomicI64,
    connection_ids: AtomicU64,
}

impl Deployment {
    pub fn new(info: ServerInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            live: Mutex::new(StoreState::default()),
            change_log: Arc::new(ChangeLog::new()),
            fail_command: Mutex::new(None),
            cursors: Mutex::new(HashMap::new()),
            kill_epoch: AtomicU64::new(0),
            request_ids: AtomicI64::new(1),
            cursor_ids: AtomicI64::new(1000),
            connection_ids: AtomicU64::new(1),
        })
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn change_log(&self) -> &Arc<ChangeLog> {
        &self.change_log
    }

    pub fn next_request_id(&self) -> i64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Point-in-time copy of the live store.
    pub fn snapshot(&self) -> ServiceResult<StoreState> {
        Ok(self.live.lock().map_err(lock_error)?.clone())
    }

    /// Apply `f` atomically to the live store. Nothing is published if `f` fails.
    pub fn publish<T>(
        &self,
        f: impl FnOnce(&mut Workspace) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let mut live = self.live.lock().map_err(lock_error)?;
        let mut workspace = Workspace::new(live.clone());
        let value = f(&mut workspace)?;
        workspace.restamp();
        *live = workspace.state;
        drop(live);
        self.change_log.append(workspace.changes);
        Ok(value)
    }

    pub fn begin_transaction(&self) -> ServiceResult<TransactionContext> {
        let base = self.snapshot()?;
        Ok(TransactionContext {
            workspace: Workspace::new(base.clone()),
            base,
            epoch: self.kill_epoch.load(Ordering::SeqCst),
        })
    }

    /// Run `f` against a transaction's workspace, rolling the workspace back on failure.
    pub fn transact<T>(
        &self,
        txn: &mut TransactionContext,
        txn_number: i64,
        f: impl FnOnce(&mut Workspace) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        if txn.epoch != self.kill_epoch.load(Ordering::SeqCst) {
            return Err(ServiceError::no_such_transaction(txn_number));
        }
        let saved = txn.workspace.clone();
        f(&mut txn.workspace).inspect_err(|_| txn.workspace = saved)
    }

    /// Publish a transaction's writes, failing with a write conflict if any
    /// namespace it touched changed underneath it.
    pub fn commit_transaction(
        &self,
        txn: TransactionContext,
        txn_number: i64,
    ) -> ServiceResult<()> {
        if txn.epoch != self.kill_epoch.load(Ordering::SeqCst) {
            return Err(ServiceError::no_such_transaction(txn_number));
        }
        let mut live = self.live.lock().map_err(lock_error)?;
        for ns in &txn.workspace.touched {
            if live.version_of(ns) != txn.base.version_of(ns) {
                debug!(namespace = %ns, txn_number, "Write conflict detected at commit");
                return Err(ServiceError::write_conflict());
            }
        }
        let mut merged = Workspace::new(live.clone());
        for ns in &txn.workspace.touched {
            merged.put_collection(ns, txn.workspace.state.collection(ns).cloned());
        }
        merged.restamp();
        *live = merged.state;
        drop(live);
        self.change_log.append(txn.workspace.changes);
        Ok(())
    }

    pub fn kill_epoch(&self) -> u64 {
        self.kill_epoch.load(Ordering::SeqCst)
    }

    /// Abort every open transaction.
    pub fn kill_all_sessions(&self) {
        self.kill_epoch.fetch_add(1, Ordering::SeqCst);
        debug!("All sessions killed");
    }

    // ------------------------------------------------------------------
    // Fail points
    // ------------------------------------------------------------------

    pub fn configure_fail_point(&self, command: &Document) -> ServiceResult<()> {
        let name = command.get_str("configureFailPoint").unwrap_or_default();
        if name != "failCommand" {
            return Err(ServiceError::bad_value(format!(
                "Unsupported fail point '{}'",
                name
            )));
        }
        let parsed = parse_fail_command(command)?;
        debug!(enabled = parsed.is_some(), "Configured failCommand fail point");
        *self.fail_command.lock().map_err(lock_error)? = parsed;
        Ok(())
    }

    pub fn disable_fail_point(&self, name: &str) -> ServiceResult<()> {
        if name == "failCommand" {
            *self.fail_command.lock().map_err(lock_error)? = None;
        }
        Ok(())
    }

    /// Consume one activation of the fail point if it applies to this command.
    pub fn check_fail_point(
        &self,
        command_name: &str,
        app_name: Option<&str>,
    ) -> ServiceResult<Option<FailPointHit>> {
        let mut slot = self.fail_command.lock().map_err(lock_error)?;
        let Some(fail) = slot.as_mut() else {
            return Ok(None);
        };
        if !fail.commands.iter().any(|c| c == command_name) {
            return Ok(None);
        }
        if fail.app_name.is_some() && fail.app_name.as_deref() != app_name {
            return Ok(None);
        }

        match &mut fail.mode {
            FailPointMode::AlwaysOn => {}
            FailPointMode::Skip(n) if *n > 0 => {
                *n -= 1;
                return Ok(None);
            }
            FailPointMode::Skip(_) => {}
            FailPointMode::Times(n) => {
                *n = n.saturating_sub(1);
            }
        }

        let hit = if fail.close_connection {
            FailPointHit {
                error: ServiceError::network(format!(
                    "Connection closed by fail point while running '{}'",
                    command_name
                )),
                close_connection: true,
            }
        } else {
            let code = fail.error_code.unwrap_or(8);
            let mut error = ServiceError::command(
                code,
                code_name(code),
                "Failing command via 'failCommand' failpoint",
            );
            for label in &fail.error_labels {
                error = error.with_label(label.clone());
            }
            FailPointHit {
                error,
                close_connection: false,
            }
        };

        if fail.mode == FailPointMode::Times(0) {
            *slot = None;
        }
        trace!(command_name, "Fail point triggered");
        Ok(Some(hit))
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Register the remainder of a result set; returns the first batch and
    /// the cursor id (0 when exhausted).
    pub fn open_cursor(
        &self,
        namespace: Namespace,
        documents: Vec<Document>,
        batch_size: Option<usize>,
    ) -> ServiceResult<(Vec<Document>, i64)> {
        let mut remaining: VecDeque<Document> = documents.into();
        let first = take_batch(&mut remaining, batch_size);
        if remaining.is_empty() {
            return Ok((first, 0));
        }
        let id = self.cursor_ids.fetch_add(1, Ordering::SeqCst);
        self.cursors
            .lock()
            .map_err(lock_error)?
            .insert(id, ServerCursor { namespace, remaining });
        Ok((first, id))
    }

    pub fn get_more(
        &self,
        cursor_id: i64,
        batch_size: Option<usize>,
    ) -> ServiceResult<(Vec<Document>, i64)> {
        let mut cursors = self.cursors.lock().map_err(lock_error)?;
        let cursor = cursors.get_mut(&cursor_id).ok_or_else(|| {
            let message = format!("cursor id {} not found", cursor_id);
            ServiceError::command(43, "CursorNotFound", message)
        })?;
        let batch = take_batch(&mut cursor.remaining, batch_size);
        if cursor.remaining.is_empty() {
            cursors.remove(&cursor_id);
            return Ok((batch, 0));
        }
        Ok((batch, cursor_id))
    }

    pub fn kill_cursor(&self, cursor_id: i64) -> ServiceResult<bool> {
        Ok(self
            .cursors
            .lock()
            .map_err(lock_error)?
            .remove(&cursor_id)
            .is_some())
    }

    pub fn cursor_namespace(&self, cursor_id: i64) -> ServiceResult<Option<Namespace>> {
        Ok(self
            .cursors
            .lock()
            .map_err(lock_error)?
            .get(&cursor_id)
            .map(|cursor| cursor.namespace.clone()))
    }
}

fn take_batch(remaining: &mut VecDeque<Document>, batch_size: Option<usize>) -> Vec<Document> {
    let size = batch_size.filter(|n| *n > 0).unwrap_or(usize::MAX);
    let count = size.min(remaining.len());
    remaining.drain(..count).collect()
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> ServiceError {
    ServiceError::invalid_argument(format!("Deployment lock poisoned: {}", err))
}

pub(crate) fn batch_size_of(value: Option<&Value>) -> Option<usize> {
    value.and_then(value_as_i64).filter(|n| *n > 0).map(|n| n as usize)
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
    fn test_transaction_commit_detects_conflict() {
        let deployment = Deployment::new(ServerInfo::default());
        let ns = Namespace::new("db", "coll");
        deployment
            .publish(|ws| ws.insert_many(&ns, vec![doc(json!({"_id": 1}))]))
            .unwrap();

        let mut txn = deployment.begin_transaction().unwrap();
        deployment
            .transact(&mut txn, 1, |ws| ws.insert_many(&ns, vec![doc(json!({"_id": 2}))]))
            .unwrap();
        deployment
            .publish(|ws| ws.insert_many(&ns, vec![doc(json!({"_id": 3}))]))
            .unwrap();

        let err = deployment.commit_transaction(txn, 1).unwrap_err();
        assert_eq!(err.code, Some(112));
        assert_eq!(deployment.snapshot().unwrap().all_documents(&ns).len(), 2);
    }

    #[test]
    fn test_transaction_commit_publishes_writes() {
        let deployment = Deployment::new(ServerInfo::default());
        let ns = Namespace::new("db", "coll");
        let mut txn = deployment.begin_transaction().unwrap();
        deployment
            .transact(&mut txn, 1, |ws| ws.insert_many(&ns, vec![doc(json!({"_id": 1}))]))
            .unwrap();
        assert!(deployment.snapshot().unwrap().all_documents(&ns).is_empty());
        deployment.commit_transaction(txn, 1).unwrap();
        assert_eq!(deployment.snapshot().unwrap().all_documents(&ns).len(), 1);
    }

    #[test]
    fn test_killed_sessions_fail_open_transactions() {
        let deployment = Deployment::new(ServerInfo::default());
        let txn = deployment.begin_transaction().unwrap();
        deployment.kill_all_sessions();
        let err = deployment.commit_transaction(txn, 4).unwrap_err();
        assert_eq!(err.code, Some(251));
    }

    #[test]
    fn test_fail_point_times_and_skip() {
        let deployment = Deployment::new(ServerInfo::default());
        deployment
            .configure_fail_point(&doc(json!({
                "configureFailPoint": "failCommand",
                "mode": {"times": 1},
                "data": {"failCommands": ["insert"], "errorCode": 91, "errorLabels": ["RetryableWriteError"]}
            })))
            .unwrap();
        assert!(deployment.check_fail_point("find", None).unwrap().is_none());
        let hit = deployment.check_fail_point("insert", None).unwrap().unwrap();
        assert_eq!(hit.error.code, Some(91));
        assert!(hit.error.labels.contains("RetryableWriteError"));
        assert!(deployment.check_fail_point("insert", None).unwrap().is_none());

        deployment
            .configure_fail_point(&doc(json!({
                "configureFailPoint": "failCommand",
                "mode": {"skip": 1},
                "data": {"failCommands": ["find"], "closeConnection": true}
            })))
            .unwrap();
        assert!(deployment.check_fail_point("find", None).unwrap().is_none());
        assert!(deployment.check_fail_point("find", None).unwrap().unwrap().close_connection);
    }

    #[test]
    fn test_cursor_batches() {
        let deployment = Deployment::new(ServerInfo::default());
        let docs: Vec<Document> = (0..5).map(|i| doc(json!({"_id": i}))).collect();
        let (first, id) = deployment
            .open_cursor(Namespace::new("db", "c"), docs, Some(2))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_ne!(id, 0);
        let (second, id) = deployment.get_more(id, Some(2)).unwrap();
        assert_eq!(second.len(), 2);
        let (last, id) = deployment.get_more(id, Some(2)).unwrap();
        assert_eq!((last.len(), id), (1, 0));
    }
}
