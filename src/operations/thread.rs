use super::arguments::Arguments;
use super::descriptor::OperationDescriptor;
use super::result::OperationResult;
use super::{CallbackOperation, Operation, OperationContext, OperationRunner};
use crate::core::{Document, Result, RunnerError};
use crate::entity::ThreadEntity;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `runOnThread`: queue one operation on a thread entity and return
/// immediately. Failures surface at `waitForThread`.
pub struct RunOnThreadOperation {
    thread: Arc<ThreadEntity>,
    operation: OperationDescriptor,
}

pub fn create(arguments: Document, ctx: &OperationContext) -> Result<Operation> {
    let args = Arguments::new("runOnThread", arguments, &["thread", "operation"])?;
    let thread = ctx.entities.thread(&args.required_string("thread")?)?;
    let operation = match args.required_value("operation")? {
        value @ Value::Object(_) => OperationDescriptor::from_value(&value)?,
        _ => return Err(RunnerError::format("runOnThread operation must be a document")),
    };
    Ok(Operation::Callback(Box::new(RunOnThreadOperation { thread, operation })))
}

#[async_trait]
impl CallbackOperation for RunOnThreadOperation {
    fn execute(
        &self,
        runner: Arc<dyn OperationRunner>,
        _cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let operation = self.operation.clone();
        self.thread.run_blocking(Box::new(move || {
            let cancel = CancellationToken::new();
            runner.run_operation(&operation, &cancel)
        }))?;
        Ok(OperationResult::Empty)
    }

    async fn execute_async(
        &self,
        runner: Arc<dyn OperationRunner>,
        _cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let operation = self.operation.clone();
        self.thread.run_async(Box::pin(async move {
            let cancel = CancellationToken::new();
            runner.run_operation_async(&operation, &cancel).await
        }))?;
        Ok(OperationResult::Empty)
    }
}
