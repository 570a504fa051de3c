use super::arguments::Arguments;
use super::collection::{CHANGE_STREAM_ARGS, change_stream_options};
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::service::{ChangeStreamOptions, ClientSession, Database};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// `createCollection` options forwarded verbatim to the `create` command.
const CREATE_COLLECTION_OPTIONS: &[&str] = &[
    "capped",
    "size",
    "max",
    "validator",
    "validationLevel",
    "validationAction",
    "timeseries",
    "expireAfterSeconds",
    "clusteredIndex",
    "changeStreamPreAndPostImages",
    "encryptedFields",
];

enum Call {
    Aggregate { pipeline: Vec<Document>, batch_size: Option<usize> },
    CreateCollection { collection: String, options: Document },
    DropCollection { collection: String },
    ListCollections { filter: Option<Document> },
    ListCollectionNames { filter: Option<Document> },
    RunCommand { command: Document },
    CreateChangeStream { pipeline: Vec<Document>, options: ChangeStreamOptions },
}

pub struct DatabaseOperation {
    database: Database,
    session: Option<ClientSession>,
    call: Call,
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let database = ctx.entities.database(target)?;
    let create_args: Vec<&str> = ["collection", "session"]
        .iter()
        .chain(CREATE_COLLECTION_OPTIONS)
        .copied()
        .collect();
    let allowed: &[&str] = match name {
        "aggregate" => &[
            "pipeline",
            "batchSize",
            "comment",
            "allowDiskUse",
            "let",
            "maxTimeMS",
            "session",
        ],
        "createCollection" => &create_args,
        "dropCollection" => &["collection", "session"],
        "listCollections" | "listCollectionNames" => &["filter", "batchSize", "session"],
        "runCommand" => &["command", "commandName", "readPreference", "session"],
        "createChangeStream" => CHANGE_STREAM_ARGS,
        other => {
            return Err(RunnerError::format(format!("Unsupported database operation '{}'", other)));
        }
    };
    let args = Arguments::new(name, arguments.clone(), allowed)?;
    let call = match name {
        "aggregate" => Call::Aggregate {
            pipeline: args.required_documents("pipeline")?,
            batch_size: args.usize("batchSize")?,
        },
        "createCollection" => {
            let options = arguments
                .into_iter()
                .filter(|(key, _)| CREATE_COLLECTION_OPTIONS.contains(&key.as_str()))
                .collect();
            Call::CreateCollection {
                collection: args.required_string("collection")?,
                options,
            }
        }
        "dropCollection" => Call::DropCollection {
            collection: args.required_string("collection")?,
        },
        "listCollections" => Call::ListCollections {
            filter: args.document("filter")?,
        },
        "listCollectionNames" => Call::ListCollectionNames {
            filter: args.document("filter")?,
        },
        "runCommand" => {
            let command = args.required_document("command")?;
            if let Some(expected) = args.string("commandName")? {
                if command.keys().next() != Some(&expected) {
                    return Err(RunnerError::format(format!(
                        "runCommand commandName '{}' does not match the command document",
                        expected
                    )));
                }
            }
            Call::RunCommand { command }
        }
        _ => Call::CreateChangeStream {
            pipeline: args.required_documents("pipeline")?,
            options: change_stream_options(&args)?,
        },
    };
    Ok(Operation::Entity(Box::new(DatabaseOperation {
        database,
        session: args.session(&ctx.entities)?,
        call,
    })))
}

fn names(names: Vec<String>) -> OperationResult {
    OperationResult::Value(Value::Array(names.into_iter().map(Value::String).collect()))
}

#[async_trait]
impl EntityOperation for DatabaseOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        let db = &self.database;
        let session = self.session.as_ref();
        match &self.call {
            Call::Aggregate { pipeline, batch_size } => db
                .aggregate(pipeline.clone(), *batch_size, session, cancel)
                .and_then(|cursor| cursor.collect_all(cancel))
                .into_result(OperationResult::documents),
            Call::CreateCollection { collection, options } => db
                .create_collection(collection, options.clone(), session, cancel)
                .into_empty(),
            Call::DropCollection { collection } => {
                db.drop_collection(collection, session, cancel).into_empty()
            }
            Call::ListCollections { filter } => db
                .list_collections(filter.as_ref(), session, cancel)
                .into_result(OperationResult::documents),
            Call::ListCollectionNames { filter } => db
                .list_collection_names(filter.as_ref(), session, cancel)
                .into_result(names),
            Call::RunCommand { command } => db
                .run_command(command.clone(), session, cancel)
                .into_result(OperationResult::document),
            Call::CreateChangeStream { pipeline, options } => db
                .watch(pipeline.clone(), options.clone(), session, cancel)
                .into_result(OperationResult::ChangeStream),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        let db = &self.database;
        let session = self.session.as_ref();
        match &self.call {
            Call::Aggregate { pipeline, batch_size } => {
                match db.aggregate_async(pipeline.clone(), *batch_size, session, cancel).await {
                    Ok(cursor) => cursor
                        .collect_all_async(cancel)
                        .await
                        .into_result(OperationResult::documents),
                    Err(err) => OperationResult::Error(err),
                }
            }
            Call::CreateCollection { collection, options } => db
                .create_collection_async(collection, options.clone(), session, cancel)
                .await
                .into_empty(),
            Call::DropCollection { collection } => db
                .drop_collection_async(collection, session, cancel)
                .await
                .into_empty(),
            Call::ListCollections { filter } => db
                .list_collections_async(filter.as_ref(), session, cancel)
                .await
                .into_result(OperationResult::documents),
            Call::ListCollectionNames { filter } => db
                .list_collection_names_async(filter.as_ref(), session, cancel)
                .await
                .into_result(names),
            Call::RunCommand { command } => db
                .run_command_async(command.clone(), session, cancel)
                .await
                .into_result(OperationResult::document),
            Call::CreateChangeStream { pipeline, options } => db
                .watch_async(pipeline.clone(), options.clone(), session, cancel)
                .await
                .into_result(OperationResult::ChangeStream),
        }
    }
}
