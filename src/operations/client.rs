use super::arguments::Arguments;
use super::collection::{CHANGE_STREAM_ARGS, change_stream_options};
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::service::{ChangeStreamOptions, Client, ClientSession};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

enum Call {
    ListDatabases { filter: Option<Document> },
    ListDatabaseNames { filter: Option<Document> },
    CreateChangeStream { pipeline: Vec<Document>, options: ChangeStreamOptions },
    Close,
}

/// Operations on a client entity.
pub struct ClientOperation {
    client: Client,
    session: Option<ClientSession>,
    call: Call,
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let client = ctx.entities.client(target)?;
    let allowed: &[&str] = match name {
        "listDatabases" | "listDatabaseNames" => &["filter", "session"],
        "createChangeStream" => CHANGE_STREAM_ARGS,
        "close" => &[],
        other => {
            return Err(RunnerError::format(format!("Unsupported client operation '{}'", other)));
        }
    };
    let args = Arguments::new(name, arguments, allowed)?;
    let call = match name {
        "listDatabases" => Call::ListDatabases {
            filter: args.document("filter")?,
        },
        "listDatabaseNames" => Call::ListDatabaseNames {
            filter: args.document("filter")?,
        },
        "createChangeStream" => Call::CreateChangeStream {
            pipeline: args.required_documents("pipeline")?,
            options: change_stream_options(&args)?,
        },
        _ => Call::Close,
    };
    Ok(Operation::Entity(Box::new(ClientOperation {
        client,
        session: args.session(&ctx.entities)?,
        call,
    })))
}

fn names(names: Vec<String>) -> OperationResult {
    OperationResult::Value(Value::Array(names.into_iter().map(Value::String).collect()))
}

#[async_trait]
impl EntityOperation for ClientOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        let session = self.session.as_ref();
        match &self.call {
            Call::ListDatabases { filter } => self
                .client
                .list_databases(filter.as_ref(), session, cancel)
                .into_result(OperationResult::documents),
            Call::ListDatabaseNames { filter } => self
                .client
                .list_database_names(filter.as_ref(), session, cancel)
                .into_result(names),
            Call::CreateChangeStream { pipeline, options } => self
                .client
                .watch(pipeline.clone(), options.clone(), session, cancel)
                .into_result(OperationResult::ChangeStream),
            Call::Close => {
                self.client.close();
                OperationResult::Empty
            }
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        let session = self.session.as_ref();
        match &self.call {
            Call::ListDatabases { filter } => self
                .client
                .list_databases_async(filter.as_ref(), session, cancel)
                .await
                .into_result(OperationResult::documents),
            Call::ListDatabaseNames { filter } => self
                .client
                .list_database_names_async(filter.as_ref(), session, cancel)
                .await
                .into_result(names),
            Call::CreateChangeStream { pipeline, options } => self
                .client
                .watch_async(pipeline.clone(), options.clone(), session, cancel)
                .await
                .into_result(OperationResult::ChangeStream),
            Call::Close => {
                tokio::task::yield_now().await;
                self.client.close();
                OperationResult::Empty
            }
        }
    }
}
