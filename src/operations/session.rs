use super::arguments::Arguments;
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext, transaction};
use crate::core::{Document, Result, RunnerError};
use crate::entity::TransactionOptionsDescriptor;
use crate::service::{ClientSession, TransactionOptions};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub(crate) const TRANSACTION_OPTION_ARGS: &[&str] =
    &["readConcern", "readPreference", "writeConcern", "maxCommitTimeMS"];

/// Transaction options given inline in an operation's arguments.
pub(crate) fn transaction_options(arguments: &Document) -> Result<Option<TransactionOptions>> {
    let inline: Document = arguments
        .iter()
        .filter(|(key, _)| TRANSACTION_OPTION_ARGS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if inline.is_empty() {
        return Ok(None);
    }
    let descriptor: TransactionOptionsDescriptor = serde_json::from_value(Value::Object(inline))
        .map_err(|err| RunnerError::format(format!("Invalid transaction options: {}", err)))?;
    Ok(Some(descriptor.into()))
}

enum Call {
    StartTransaction(Option<TransactionOptions>),
    CommitTransaction,
    AbortTransaction,
    EndSession,
}

pub struct SessionOperation {
    session: ClientSession,
    call: Call,
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let session = ctx.entities.session(target)?;
    let call = match name {
        "withTransaction" => return transaction::create(session, arguments),
        "startTransaction" => {
            Arguments::new(name, arguments.clone(), TRANSACTION_OPTION_ARGS)?;
            Call::StartTransaction(transaction_options(&arguments)?)
        }
        "commitTransaction" | "abortTransaction" | "endSession" => {
            Arguments::new(name, arguments, &[])?;
            match name {
                "commitTransaction" => Call::CommitTransaction,
                "abortTransaction" => Call::AbortTransaction,
                _ => Call::EndSession,
            }
        }
        other => {
            return Err(RunnerError::format(format!("Unsupported session operation '{}'", other)));
        }
    };
    Ok(Operation::Entity(Box::new(SessionOperation { session, call })))
}

#[async_trait]
impl EntityOperation for SessionOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        match &self.call {
            Call::StartTransaction(options) => {
                self.session.start_transaction(options.clone()).into_empty()
            }
            Call::CommitTransaction => self.session.commit_transaction(cancel).into_empty(),
            Call::AbortTransaction => self.session.abort_transaction(cancel).into_empty(),
            Call::EndSession => {
                self.session.end_session(cancel);
                OperationResult::Empty
            }
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        match &self.call {
            Call::StartTransaction(options) => self
                .session
                .start_transaction_async(options.clone(), cancel)
                .await
                .into_empty(),
            Call::CommitTransaction => {
                self.session.commit_transaction_async(cancel).await.into_empty()
            }
            Call::AbortTransaction => {
                self.session.abort_transaction_async(cancel).await.into_empty()
            }
            Call::EndSession => {
                self.session.end_session_async(cancel).await;
                OperationResult::Empty
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inline_transaction_options() {
        let args = json!({"callback": [], "writeConcern": {"w": "majority"}, "maxCommitTimeMS": 60});
        let options = transaction_options(args.as_object().unwrap()).unwrap().unwrap();
        assert_eq!(options.max_commit_time_ms, Some(60));
        assert!(options.write_concern.is_some());
        assert!(transaction_options(json!({"callback": []}).as_object().unwrap()).unwrap().is_none());
    }
}
