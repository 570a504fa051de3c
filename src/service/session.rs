// ============================================================================
// Client Sessions & Transactions
// ============================================================================
//
// State machine:
//
//   None --start--> Starting --first command--> InProgress --commit--> Committed
//                      |                            |
//                      +-----------abort------------+-----------> Aborted
//
// Transactions run against a snapshot of the store; their writes become
// visible only when the commit succeeds.
//
// ============================================================================

use super::client::{Client, CommandRequest, RetryKind, new_lsid};
use super::deployment::{Deployment, TransactionContext};
use super::error::{
    HasErrorLabels, ServiceError, ServiceResult, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use super::store::{StoreState, Workspace};
use crate::core::Document;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on the time `with_transaction` keeps retrying.
pub const WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::None => "none",
            TransactionState::Starting => "starting",
            TransactionState::InProgress => "in_progress",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub read_concern: Option<Document>,
    pub read_preference: Option<Document>,
    pub write_concern: Option<Document>,
    pub max_commit_time_ms: Option<u64>,
}

impl TransactionOptions {
    /// Fill unset fields from `defaults`.
    pub fn merged_with(&self, defaults: &TransactionOptions) -> TransactionOptions {
        TransactionOptions {
            read_concern: self.read_concern.clone().or_else(|| defaults.read_concern.clone()),
            read_preference: self
                .read_preference
                .clone()
                .or_else(|| defaults.read_preference.clone()),
            write_concern: self.write_concern.clone().or_else(|| defaults.write_concern.clone()),
            max_commit_time_ms: self.max_commit_time_ms.or(defaults.max_commit_time_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub causal_consistency: Option<bool>,
    pub snapshot: Option<bool>,
    pub default_transaction_options: TransactionOptions,
}

#[derive(Debug)]
struct SessionState {
    transaction: TransactionState,
    txn_number: i64,
    options: TransactionOptions,
    context: Option<TransactionContext>,
    commands_sent: bool,
    last_commit_ok: Option<bool>,
}

struct SessionInner {
    client: Client,
    lsid: Document,
    options: SessionOptions,
    state: Mutex<SessionState>,
    dirty: AtomicBool,
    ended: AtomicBool,
}

/// Handle to a logical session. Clones share state.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> ServiceError {
    ServiceError::invalid_argument(format!("Session lock poisoned: {}", err))
}

impl ClientSession {
    pub(crate) fn new(client: Client, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                client,
                lsid: new_lsid(),
                options,
                state: Mutex::new(SessionState {
                    transaction: TransactionState::None,
                    txn_number: 0,
                    options: TransactionOptions::default(),
                    context: None,
                    commands_sent: false,
                    last_commit_ok: None,
                }),
                dirty: AtomicBool::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> ServiceResult<MutexGuard<'_, SessionState>> {
        self.inner.state.lock().map_err(lock_error)
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn lsid(&self) -> &Document {
        &self.inner.lsid
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    pub fn has_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_usable(&self) -> ServiceResult<()> {
        if self.has_ended() {
            return Err(ServiceError::closed("session"));
        }
        Ok(())
    }

    pub fn transaction_state(&self) -> ServiceResult<TransactionState> {
        Ok(self.state()?.transaction)
    }

    pub fn in_transaction(&self) -> ServiceResult<bool> {
        Ok(matches!(
            self.transaction_state()?,
            TransactionState::Starting | TransactionState::InProgress
        ))
    }

    pub fn txn_number(&self) -> ServiceResult<i64> {
        Ok(self.state()?.txn_number)
    }

    // ------------------------------------------------------------------
    // Pipeline hooks
    // ------------------------------------------------------------------

    /// Fields appended to a command sent with this session; starts the
    /// server-side transaction on its first command.
    pub(crate) fn command_fields(
        &self,
        command_name: &str,
        deployment: &Deployment,
    ) -> ServiceResult<Document> {
        let mut state = self.state()?;
        let mut fields = Document::new();
        match state.transaction {
            TransactionState::Starting => {
                state.context = Some(deployment.begin_transaction()?);
                state.transaction = TransactionState::InProgress;
                state.commands_sent = true;
                fields.insert("txnNumber".to_string(), Value::from(state.txn_number));
                fields.insert("startTransaction".to_string(), Value::Bool(true));
                fields.insert("autocommit".to_string(), Value::Bool(false));
                if let Some(read_concern) = &state.options.read_concern {
                    fields.insert("readConcern".to_string(), Value::Object(read_concern.clone()));
                }
            }
            TransactionState::InProgress => {
                fields.insert("txnNumber".to_string(), Value::from(state.txn_number));
                fields.insert("autocommit".to_string(), Value::Bool(false));
            }
            TransactionState::Committed if command_name == "commitTransaction" => {
                fields.insert("txnNumber".to_string(), Value::from(state.txn_number));
                fields.insert("autocommit".to_string(), Value::Bool(false));
            }
            TransactionState::Committed | TransactionState::Aborted => {
                state.transaction = TransactionState::None;
            }
            TransactionState::None => {}
        }
        if matches!(command_name, "commitTransaction" | "abortTransaction") {
            if let Some(write_concern) = &state.options.write_concern {
                fields.insert("writeConcern".to_string(), Value::Object(write_concern.clone()));
            }
        }
        Ok(fields)
    }

    pub(crate) fn transaction_view(
        &self,
        deployment: &Deployment,
    ) -> ServiceResult<Option<StoreState>> {
        let state = self.state()?;
        match (&state.transaction, &state.context) {
            (TransactionState::InProgress, Some(context)) => {
                if context.epoch != deployment.kill_epoch() {
                    return Err(ServiceError::no_such_transaction(state.txn_number));
                }
                Ok(Some(context.workspace.state.clone()))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn transaction_write<T>(
        &self,
        deployment: &Deployment,
        f: impl FnOnce(&mut Workspace) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let mut state = self.state()?;
        let txn_number = state.txn_number;
        let context = state
            .context
            .as_mut()
            .ok_or_else(|| ServiceError::no_such_transaction(txn_number))?;
        deployment.transact(context, txn_number, f)
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    pub fn start_transaction(&self, options: Option<TransactionOptions>) -> ServiceResult<()> {
        self.ensure_usable()?;
        if !self.inner.client.deployment().info().supports_transactions() {
            return Err(ServiceError::invalid_argument(
                "Transactions are not supported by this deployment",
            ));
        }
        let mut state = self.state()?;
        if matches!(
            state.transaction,
            TransactionState::Starting | TransactionState::InProgress
        ) {
            return Err(ServiceError::invalid_argument("Transaction already in progress"));
        }
        state.txn_number += 1;
        state.transaction = TransactionState::Starting;
        state.options = options
            .unwrap_or_default()
            .merged_with(&self.inner.options.default_transaction_options);
        state.context = None;
        state.commands_sent = false;
        state.last_commit_ok = None;
        debug!(txn_number = state.txn_number, "Transaction started");
        Ok(())
    }

    pub fn commit_transaction(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let (max_commit_time_ms, txn_number) = {
            let mut state = self.state()?;
            match state.transaction {
                TransactionState::None => {
                    return Err(ServiceError::invalid_argument("No transaction started"));
                }
                TransactionState::Aborted => {
                    return Err(ServiceError::invalid_argument(
                        "Cannot call commitTransaction after calling abortTransaction",
                    ));
                }
                TransactionState::Starting => {
                    state.transaction = TransactionState::Committed;
                    state.last_commit_ok = Some(true);
                    return Ok(());
                }
                TransactionState::Committed if !state.commands_sent => return Ok(()),
                TransactionState::InProgress | TransactionState::Committed => {
                    state.transaction = TransactionState::Committed;
                }
            }
            (state.options.max_commit_time_ms, state.txn_number)
        };

        let mut command = Document::new();
        command.insert("commitTransaction".to_string(), Value::from(1));
        if let Some(max) = max_commit_time_ms {
            command.insert("maxTimeMS".to_string(), Value::from(max));
        }
        let request = CommandRequest::new("admin", "commitTransaction", command)
            .session(Some(self))
            .retry(RetryKind::Write);
        self.inner.client.execute(request, cancel, |ctx| {
            let (taken, previous) = {
                let mut state = self.state()?;
                (state.context.take(), state.last_commit_ok)
            };
            let outcome = match taken {
                Some(context) => ctx.deployment().commit_transaction(context, txn_number),
                None if previous == Some(true) => Ok(()),
                None => Err(ServiceError::no_such_transaction(txn_number)),
            };
            self.state()?.last_commit_ok = Some(outcome.is_ok());
            outcome?;
            let mut reply = Document::new();
            reply.insert("ok".to_string(), Value::from(1));
            Ok(((), reply))
        })
    }

    pub fn abort_transaction(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        match self.transaction_state()? {
            TransactionState::None => {
                return Err(ServiceError::invalid_argument("No transaction started"));
            }
            TransactionState::Committed => {
                return Err(ServiceError::invalid_argument(
                    "Cannot call abortTransaction after calling commitTransaction",
                ));
            }
            TransactionState::Aborted => {
                return Err(ServiceError::invalid_argument("Cannot call abortTransaction twice"));
            }
            TransactionState::Starting => {
                self.state()?.transaction = TransactionState::Aborted;
                return Ok(());
            }
            TransactionState::InProgress => {}
        }

        let mut command = Document::new();
        command.insert("abortTransaction".to_string(), Value::from(1));
        let request = CommandRequest::new("admin", "abortTransaction", command).session(Some(self));
        let result = self.inner.client.execute(request, cancel, |_| {
            self.state()?.context = None;
            let mut reply = Document::new();
            reply.insert("ok".to_string(), Value::from(1));
            Ok(((), reply))
        });
        if let Err(err) = result {
            debug!(error = %err, "Ignoring abortTransaction failure");
        }
        let mut state = self.state()?;
        state.transaction = TransactionState::Aborted;
        state.context = None;
        Ok(())
    }

    /// End the session, aborting any open transaction. Idempotent.
    pub fn end_session(&self, cancel: &CancellationToken) {
        if self.has_ended() {
            return;
        }
        if self.in_transaction().unwrap_or(false) {
            let _ = self.abort_transaction(cancel);
        }
        self.inner.ended.store(true, Ordering::SeqCst);
    }

    pub async fn start_transaction_async(
        &self,
        options: Option<TransactionOptions>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        super::yield_checked(cancel).await?;
        self.start_transaction(options)
    }

    async_pair!(commit_transaction_async => commit_transaction() -> ServiceResult<()>);
    async_pair!(abort_transaction_async => abort_transaction() -> ServiceResult<()>);

    pub async fn end_session_async(&self, cancel: &CancellationToken) {
        tokio::task::yield_now().await;
        self.end_session(cancel);
    }

    // ------------------------------------------------------------------
    // Convenient transactions API
    // ------------------------------------------------------------------

    /// Run `callback` inside a transaction, retrying on transient errors and
    /// on unknown commit results until the retry window closes.
    pub fn with_transaction<T, E, F>(
        &self,
        options: Option<TransactionOptions>,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: From<ServiceError> + HasErrorLabels,
    {
        let started = Instant::now();
        'transaction: loop {
            self.start_transaction(options.clone())?;
            let value = match callback() {
                Ok(value) => value,
                Err(err) => {
                    if self.in_transaction()? {
                        let _ = self.abort_transaction(cancel);
                    }
                    if err.has_error_label(TRANSIENT_TRANSACTION_ERROR)
                        && started.elapsed() < WITH_TRANSACTION_TIMEOUT
                    {
                        debug!("Retrying transaction callback after transient error");
                        continue 'transaction;
                    }
                    return Err(err);
                }
            };
            if !self.in_transaction()? {
                return Ok(value);
            }
            loop {
                match self.commit_transaction(cancel) {
                    Ok(()) => return Ok(value),
                    Err(err) => match retry_decision(&err, started) {
                        Retry::Commit => continue,
                        Retry::Transaction => continue 'transaction,
                        Retry::No => return Err(err.into()),
                    },
                }
            }
        }
    }

    pub async fn with_transaction_async<'b, T, E, F>(
        &self,
        options: Option<TransactionOptions>,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> BoxFuture<'b, Result<T, E>>,
        E: From<ServiceError> + HasErrorLabels,
    {
        let started = Instant::now();
        'transaction: loop {
            self.start_transaction_async(options.clone(), cancel).await?;
            let value = match callback().await {
                Ok(value) => value,
                Err(err) => {
                    if self.in_transaction()? {
                        let _ = self.abort_transaction_async(cancel).await;
                    }
                    if err.has_error_label(TRANSIENT_TRANSACTION_ERROR)
                        && started.elapsed() < WITH_TRANSACTION_TIMEOUT
                    {
                        continue 'transaction;
                    }
                    return Err(err);
                }
            };
            if !self.in_transaction()? {
                return Ok(value);
            }
            loop {
                match self.commit_transaction_async(cancel).await {
                    Ok(()) => return Ok(value),
                    Err(err) => match retry_decision(&err, started) {
                        Retry::Commit => continue,
                        Retry::Transaction => continue 'transaction,
                        Retry::No => return Err(err.into()),
                    },
                }
            }
        }
    }
}

enum Retry {
    Commit,
    Transaction,
    No,
}

fn retry_decision(err: &ServiceError, started: Instant) -> Retry {
    if started.elapsed() >= WITH_TRANSACTION_TIMEOUT {
        return Retry::No;
    }
    if err.has_error_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) && err.code != Some(50) {
        return Retry::Commit;
    }
    if err.has_error_label(TRANSIENT_TRANSACTION_ERROR) {
        return Retry::Transaction;
    }
    Retry::No
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::client::ClientOptions;
    use crate::service::deployment::{ServerInfo, Topology};
    use crate::service::error::ErrorKind;
    use crate::service::store::Namespace;
    use serde_json::json;

    fn setup() -> (Client, ClientSession, CancellationToken) {
        let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
        let session = client.start_session(SessionOptions::default()).unwrap();
        (client, session, CancellationToken::new())
    }

    #[test]
    fn test_state_machine_transitions() {
        let (_client, session, cancel) = setup();
        assert_eq!(session.transaction_state().unwrap(), TransactionState::None);
        session.start_transaction(None).unwrap();
        assert_eq!(session.transaction_state().unwrap(), TransactionState::Starting);
        assert!(session.start_transaction(None).is_err());
        session.commit_transaction(&cancel).unwrap();
        assert_eq!(session.transaction_state().unwrap(), TransactionState::Committed);
        assert!(session.abort_transaction(&cancel).is_err());

        session.start_transaction(None).unwrap();
        session.abort_transaction(&cancel).unwrap();
        assert_eq!(session.transaction_state().unwrap(), TransactionState::Aborted);
        assert!(session.commit_transaction(&cancel).is_err());
    }

    #[test]
    fn test_single_topology_rejects_transactions() {
        let deployment = Deployment::new(ServerInfo::default().topology(Topology::Single));
        let client = Client::new(deployment, ClientOptions::default());
        let session = client.start_session(SessionOptions::default()).unwrap();
        assert!(session.start_transaction(None).is_err());
    }

    #[test]
    fn test_with_transaction_retries_transient_errors() {
        let (client, session, cancel) = setup();
        let coll = client.database("db").collection("coll");
        let mut attempts = 0;
        let result: Result<(), ServiceError> = session.with_transaction(None, &cancel, || {
            attempts += 1;
            let doc = json!({"_id": attempts}).as_object().cloned().unwrap();
            coll.insert_one(doc, Default::default(), Some(&session), &cancel)?;
            if attempts < 3 {
                return Err(ServiceError::write_conflict());
            }
            Ok(())
        });
        result.unwrap();
        assert_eq!(attempts, 3);
        let docs = client
            .deployment()
            .snapshot()
            .unwrap()
            .all_documents(&Namespace::new("db", "coll"));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], json!(3));
    }

    #[test]
    fn test_ended_session_is_unusable() {
        let (client, session, cancel) = setup();
        session.end_session(&cancel);
        session.end_session(&cancel);
        let err = client
            .list_databases(None, Some(&session), &cancel)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);
    }
}
