use rustmemodb_unified::entity::parse_descriptors;
use rustmemodb_unified::operations::{OperationContext, OperationRunner};
use rustmemodb_unified::runner::OperationDispatcher;
use rustmemodb_unified::{
    Deployment, EntityMap, EntityMapBuilder, OperationDescriptor, RunnerConfig, RunnerError,
    ServerInfo, UnifiedValueMatcher,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn dispatcher() -> (OperationDispatcher, Arc<EntityMap>) {
    let config = RunnerConfig::default();
    let descriptors = parse_descriptors(&[
        json!({"client": {"id": "client0"}}),
        json!({"database": {"id": "db0", "client": "client0", "databaseName": "dispatch"}}),
        json!({"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}}),
    ])
    .unwrap();
    let entities = Arc::new(
        EntityMapBuilder::new(Deployment::new(ServerInfo::default()), &config)
            .build(&descriptors)
            .unwrap(),
    );
    let dispatcher = OperationDispatcher::new(OperationContext {
        entities: entities.clone(),
        config: Arc::new(config),
        matcher: Arc::new(UnifiedValueMatcher::with_entities(entities.clone())),
        loop_cancel: CancellationToken::new(),
    });
    (dispatcher, entities)
}

fn op(value: Value) -> OperationDescriptor {
    OperationDescriptor::from_value(&value).unwrap()
}

fn seed_ops() -> Vec<OperationDescriptor> {
    vec![
        op(json!({"name": "insertMany", "object": "coll0", "arguments": {"documents": [{"_id": 1, "n": 1}, {"_id": 2, "n": 2}]}})),
        op(json!({
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {}, "sort": {"_id": -1}},
            "saveResultAsEntity": "found"
        })),
    ]
}

#[test]
fn test_sync_dispatch_saves_results() {
    let (dispatcher, entities) = dispatcher();
    let cancel = CancellationToken::new();
    for operation in seed_ops() {
        dispatcher.run_operation(&operation, &cancel).unwrap();
    }
    assert_eq!(entities.result("found").unwrap(), json!([{"_id": 2, "n": 2}, {"_id": 1, "n": 1}]));
}

#[tokio::test]
async fn test_async_dispatch_matches_sync() {
    let (dispatcher, entities) = dispatcher();
    let cancel = CancellationToken::new();
    for operation in seed_ops() {
        dispatcher.run_operation_async(&operation, &cancel).await.unwrap();
    }
    assert_eq!(entities.result("found").unwrap(), json!([{"_id": 2, "n": 2}, {"_id": 1, "n": 1}]));
}

#[test]
fn test_non_document_filter_is_format_error() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .run_operation(
            &op(json!({"name": "find", "object": "coll0", "arguments": {"filter": 5}})),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RunnerError::Format(_)));
}

#[test]
fn test_missing_required_argument_is_format_error() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .run_operation(&op(json!({"name": "insertOne", "object": "coll0"})), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RunnerError::Format(_)));
}

#[test]
fn test_unsupported_operation_is_format_error() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .run_operation(&op(json!({"name": "explode", "object": "coll0"})), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RunnerError::Format(_)));
}

#[test]
fn test_expect_error_without_error_fails() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .run_operation(
            &op(json!({
                "name": "insertOne",
                "object": "coll0",
                "arguments": {"document": {"_id": 9}},
                "expectError": {"isError": true}
            })),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(err.is_assertion());
}

#[tokio::test]
async fn test_cancelled_operation_reports_error() {
    let (dispatcher, _) = dispatcher();
    let cancel = CancellationToken::new();
    cancel.cancel();
    dispatcher
        .run_operation_async(
            &op(json!({
                "name": "insertOne",
                "object": "coll0",
                "arguments": {"document": {"_id": 1}},
                "expectError": {"isClientError": true}
            })),
            &cancel,
        )
        .await
        .unwrap();
}

#[test]
fn test_disposed_map_rejects_operations() {
    let (dispatcher, entities) = dispatcher();
    entities.dispose();
    let err = dispatcher
        .run_operation(
            &op(json!({"name": "insertOne", "object": "coll0", "arguments": {"document": {"_id": 1}}})),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RunnerError::Disposed));
}
