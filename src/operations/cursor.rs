use super::arguments::Arguments;
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::entity::EntityKind;
use crate::service::{ChangeStream, Cursor, ServiceError};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

enum Target {
    Cursor(Cursor),
    ChangeStream(ChangeStream),
}

#[derive(Clone, Copy)]
enum Call {
    IterateUntilDocumentOrError,
    IterateOnce,
    Close,
}

/// Iteration and closing of cursor and change stream entities.
pub struct CursorOperation {
    target: Target,
    call: Call,
    /// How long a change stream iteration waits for the next event.
    wait_timeout: Duration,
}

pub fn create(
    name: &str,
    target: &str,
    kind: EntityKind,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let call = match name {
        "iterateUntilDocumentOrError" => Call::IterateUntilDocumentOrError,
        "iterateOnce" => Call::IterateOnce,
        "close" => Call::Close,
        other => {
            return Err(RunnerError::format(format!("Unsupported {} operation '{}'", kind, other)));
        }
    };
    Arguments::new(name, arguments, &[])?;
    let target = match kind {
        EntityKind::ChangeStream => Target::ChangeStream(ctx.entities.change_stream(target)?),
        _ => Target::Cursor(ctx.entities.cursor(target)?),
    };
    Ok(Operation::Entity(Box::new(CursorOperation {
        target,
        call,
        wait_timeout: ctx.config.wait_timeout,
    })))
}

impl CursorOperation {
    fn no_event(&self) -> OperationResult {
        OperationResult::Error(ServiceError::timeout(format!(
            "No change event arrived within {:?}",
            self.wait_timeout
        )))
    }
}

#[async_trait]
impl EntityOperation for CursorOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        match (&self.target, self.call) {
            (Target::Cursor(cursor), Call::IterateUntilDocumentOrError | Call::IterateOnce) => {
                cursor.try_next(cancel).into_result(OperationResult::optional_document)
            }
            (Target::Cursor(cursor), Call::Close) => cursor.close(cancel).into_empty(),
            (Target::ChangeStream(stream), Call::IterateUntilDocumentOrError) => {
                match stream.next_timeout(self.wait_timeout, cancel) {
                    Ok(Some(event)) => OperationResult::document(event),
                    Ok(None) => self.no_event(),
                    Err(err) => OperationResult::Error(err),
                }
            }
            (Target::ChangeStream(stream), Call::IterateOnce) => {
                stream.try_next(cancel).into_result(OperationResult::optional_document)
            }
            (Target::ChangeStream(stream), Call::Close) => stream.close(cancel).into_empty(),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        match (&self.target, self.call) {
            (Target::Cursor(cursor), Call::IterateUntilDocumentOrError | Call::IterateOnce) => {
                cursor
                    .try_next_async(cancel)
                    .await
                    .into_result(OperationResult::optional_document)
            }
            (Target::Cursor(cursor), Call::Close) => cursor.close_async(cancel).await.into_empty(),
            (Target::ChangeStream(stream), Call::IterateUntilDocumentOrError) => {
                match stream.next_timeout_async(self.wait_timeout, cancel).await {
                    Ok(Some(event)) => OperationResult::document(event),
                    Ok(None) => self.no_event(),
                    Err(err) => OperationResult::Error(err),
                }
            }
            (Target::ChangeStream(stream), Call::IterateOnce) => stream
                .try_next_async(cancel)
                .await
                .into_result(OperationResult::optional_document),
            (Target::ChangeStream(stream), Call::Close) => {
                stream.close_async(cancel).await.into_empty()
            }
        }
    }
}
