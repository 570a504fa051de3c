// ============================================================================
// Operation Dispatcher
// ============================================================================
//
// Creates the handler for each descriptor, executes it on the requested
// path and checks the outcome against the descriptor's expectations.
// Control-flow handlers receive the dispatcher back as their runner.
//
// ============================================================================

use crate::core::{Result, RunnerError};
use crate::operations::{
    Operation, OperationContext, OperationDescriptor, OperationFactory, OperationResult,
    OperationRunner,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct OperationDispatcher {
    ctx: Arc<OperationContext>,
}

impl OperationDispatcher {
    pub fn new(ctx: OperationContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn create(&self, descriptor: &OperationDescriptor) -> Result<Operation> {
        let operation = OperationFactory::new(&self.ctx).create(descriptor)?;
        debug!(operation = %descriptor.name, target = %descriptor.object, "Running operation");
        Ok(operation)
    }

    /// Check `result` against the descriptor's expectations and save it.
    pub fn settle(&self, descriptor: &OperationDescriptor, result: OperationResult) -> Result<()> {
        trace!(operation = %descriptor.name, result = ?result, "Operation finished");
        if descriptor.ignore_result_and_error {
            return Ok(());
        }

        if let Some(expected) = &descriptor.expect_error {
            return match result.error() {
                Some(err) => self.ctx.matcher.assert_errors_match(err, expected),
                None => Err(RunnerError::assertion(format!(
                    "operation '{}' was expected to fail but returned {:?}",
                    descriptor.name, result
                ))),
            };
        }

        let result = match result {
            OperationResult::Error(err) => return Err(RunnerError::Service(err)),
            other => other,
        };

        if let Some(expected) = &descriptor.expect_result {
            self.ctx
                .matcher
                .assert_values_match(result.value(), expected)
                .map_err(|err| match err {
                    RunnerError::Assertion(message) => RunnerError::assertion(format!(
                        "result of '{}' does not match: {}",
                        descriptor.name, message
                    )),
                    other => other,
                })?;
        }

        if let Some(id) = &descriptor.save_result_as_entity {
            let entities = &self.ctx.entities;
            match result {
                OperationResult::Value(value) => entities.save_result(id, value)?,
                OperationResult::Cursor(cursor) => entities.save_cursor(id, cursor)?,
                OperationResult::ChangeStream(stream) => entities.save_change_stream(id, stream)?,
                OperationResult::Empty | OperationResult::Error(_) => {
                    return Err(RunnerError::InvalidState(format!(
                        "operation '{}' produced no result to save as '{}'",
                        descriptor.name, id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OperationRunner for OperationDispatcher {
    fn run_operation(
        &self,
        descriptor: &OperationDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = match self.create(descriptor)? {
            Operation::Entity(handler) => handler.execute(cancel),
            Operation::Special(handler) => {
                handler.execute(cancel)?;
                OperationResult::Empty
            }
            Operation::Callback(handler) => handler.execute(Arc::new(self.clone()), cancel)?,
        };
        self.settle(descriptor, result)
    }

    async fn run_operation_async(
        &self,
        descriptor: &OperationDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = match self.create(descriptor)? {
            Operation::Entity(handler) => handler.execute_async(cancel).await,
            Operation::Special(handler) => {
                handler.execute_async(cancel).await?;
                OperationResult::Empty
            }
            Operation::Callback(handler) => {
                handler.execute_async(Arc::new(self.clone()), cancel).await?
            }
        };
        self.settle(descriptor, result)
    }
}
