use super::arguments::Arguments;
use super::descriptor::{OperationDescriptor, parse_operations};
use super::result::OperationResult;
use super::session::{TRANSACTION_OPTION_ARGS, transaction_options};
use super::{CallbackOperation, Operation, OperationRunner};
use crate::core::{Document, Result, RunnerError};
use crate::service::{ClientSession, TransactionOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// `withTransaction`: run the callback operations inside the session's
/// convenient transaction API, which retries on transient errors.
pub struct WithTransactionOperation {
    session: ClientSession,
    options: Option<TransactionOptions>,
    callback: Vec<OperationDescriptor>,
}

pub fn create(session: ClientSession, arguments: Document) -> Result<Operation> {
    let mut allowed = vec!["callback"];
    allowed.extend_from_slice(TRANSACTION_OPTION_ARGS);
    let args = Arguments::new("withTransaction", arguments.clone(), &allowed)?;
    let callback = match args.required_value("callback")? {
        Value::Array(items) => parse_operations(&items)?,
        _ => {
            return Err(RunnerError::format(
                "withTransaction callback must be an array of operations",
            ));
        }
    };
    Ok(Operation::Callback(Box::new(WithTransactionOperation {
        session,
        options: transaction_options(&arguments)?,
        callback,
    })))
}

/// Service errors escaping the transaction are the operation's result;
/// anything else fails the scenario.
fn settle(outcome: Result<()>) -> Result<OperationResult> {
    match outcome {
        Ok(()) => Ok(OperationResult::Empty),
        Err(RunnerError::Service(err)) => Ok(OperationResult::Error(err)),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl CallbackOperation for WithTransactionOperation {
    fn execute(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        debug!(operations = self.callback.len(), "Running withTransaction callback");
        let outcome = self.session.with_transaction(self.options.clone(), cancel, || {
            for operation in &self.callback {
                runner.run_operation(operation, cancel)?;
            }
            Ok::<(), RunnerError>(())
        });
        settle(outcome)
    }

    async fn execute_async(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        debug!(operations = self.callback.len(), "Running withTransaction callback");
        let operations = &self.callback;
        let runner = &runner;
        let outcome = self
            .session
            .with_transaction_async(self.options.clone(), cancel, || {
                Box::pin(async move {
                    for operation in operations {
                        runner.run_operation_async(operation, cancel).await?;
                    }
                    Ok::<(), RunnerError>(())
                })
            })
            .await;
        settle(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceError;

    #[test]
    fn test_settle_keeps_service_errors_as_results() {
        assert!(settle(Ok(())).unwrap().is_empty());
        let result = settle(Err(RunnerError::Service(ServiceError::bad_value("bad")))).unwrap();
        assert!(result.is_error());
        assert!(settle(Err(RunnerError::assertion("mismatch"))).is_err());
    }
}
