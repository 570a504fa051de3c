use rustmemodb_unified::entity::parse_descriptors;
use rustmemodb_unified::{
    Deployment, EntityKind, EntityMap, EntityMapBuilder, RunnerConfig, RunnerError, ServerInfo,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn build(deployment: &Arc<Deployment>, descriptors: Value) -> Result<EntityMap, RunnerError> {
    let config = RunnerConfig::default();
    let descriptors = parse_descriptors(descriptors.as_array().unwrap())?;
    EntityMapBuilder::new(deployment.clone(), &config).build(&descriptors)
}

fn standard() -> Value {
    json!([
        {"client": {"id": "client0", "observeEvents": ["commandStartedEvent"], "storeEventsAsEntities": [
            {"id": "started", "events": ["commandStartedEvent"]}
        ]}},
        {"database": {"id": "db0", "client": "client0", "databaseName": "app"}},
        {"collection": {"id": "coll0", "database": "db0", "collectionName": "items"}},
        {"session": {"id": "session0", "client": "client0"}},
        {"bucket": {"id": "bucket0", "database": "db0"}},
        {"thread": {"id": "thread0"}}
    ])
}

#[test]
fn test_builds_every_kind() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();

    assert_eq!(map.kind_of("client0").unwrap(), EntityKind::Client);
    assert_eq!(map.kind_of("db0").unwrap(), EntityKind::Database);
    assert_eq!(map.kind_of("coll0").unwrap(), EntityKind::Collection);
    assert_eq!(map.kind_of("session0").unwrap(), EntityKind::Session);
    assert_eq!(map.kind_of("bucket0").unwrap(), EntityKind::Bucket);
    assert_eq!(map.kind_of("thread0").unwrap(), EntityKind::Thread);
    assert!(map.session_lsid("session0").unwrap().contains_key("id"));
    assert_eq!(map.database_names().unwrap(), vec!["app".to_string()]);
    assert_eq!(map.result("started").unwrap(), json!([]));
}

#[test]
fn test_duplicate_id_is_rejected() {
    let deployment = Deployment::new(ServerInfo::default());
    let err = build(
        &deployment,
        json!([
            {"client": {"id": "dup"}},
            {"database": {"id": "dup", "client": "dup", "databaseName": "app"}}
        ]),
    )
    .err()
    .unwrap();
    assert!(matches!(err, RunnerError::EntityExists(id) if id == "dup"));
}

#[test]
fn test_reference_must_exist() {
    let deployment = Deployment::new(ServerInfo::default());
    let err = build(
        &deployment,
        json!([{"database": {"id": "db0", "client": "missing", "databaseName": "app"}}]),
    )
    .err()
    .unwrap();
    assert!(matches!(err, RunnerError::EntityNotFound { .. }));
}

#[test]
fn test_unknown_descriptor_field_is_format_error() {
    let err = parse_descriptors(&[json!({"client": {"id": "c", "bogus": 1}})]).unwrap_err();
    assert!(matches!(err, RunnerError::Format(_)));
}

#[test]
fn test_wrong_kind_lookup_fails() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();
    assert!(map.collection("client0").is_err());
    assert!(map.client("client0").is_ok());
}

#[test]
fn test_saved_results_are_single_assignment() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();

    map.save_result("count", json!(1)).unwrap();
    assert!(matches!(
        map.save_result("count", json!(2)),
        Err(RunnerError::EntityExists(id)) if id == "count"
    ));
    assert_eq!(map.result("count").unwrap(), json!(1));
    assert!(matches!(
        map.save_result("client0", json!(3)),
        Err(RunnerError::EntityExists(_))
    ));
}

#[test]
fn test_add_entities_merges_child_map() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();

    let config = RunnerConfig::default();
    let descriptors = parse_descriptors(&[json!({"collection": {"id": "coll1", "database": "db0", "collectionName": "more"}})])
        .unwrap();
    let child = EntityMapBuilder::new(deployment.clone(), &config)
        .parent(&map)
        .build(&descriptors)
        .unwrap();
    map.add_entities(child).unwrap();
    assert_eq!(map.kind_of("coll1").unwrap(), EntityKind::Collection);

    let clash = parse_descriptors(&[json!({"thread": {"id": "thread0"}})]).unwrap();
    let err = EntityMapBuilder::new(deployment.clone(), &config)
        .parent(&map)
        .build(&clash)
        .err()
        .unwrap();
    assert!(matches!(err, RunnerError::EntityExists(_)));
}

#[test]
fn test_dispose_is_idempotent_and_final() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();
    map.dispose();
    map.dispose();
    assert!(map.is_disposed());
    assert!(matches!(map.client("client0"), Err(RunnerError::Disposed)));
}

#[test]
fn test_rejected_merge_releases_incoming_entities() {
    let deployment = Deployment::new(ServerInfo::default());
    let map = build(&deployment, standard()).unwrap();

    let child = build(
        &deployment,
        json!([
            {"client": {"id": "client1"}},
            {"session": {"id": "session1", "client": "client1"}},
            {"client": {"id": "client0"}}
        ]),
    )
    .unwrap();
    let orphan = child.client("client1").unwrap();
    let session = child.session("session1").unwrap();

    let err = map.add_entities(child).err().unwrap();
    assert!(matches!(err, RunnerError::EntityExists(id) if id == "client0"));
    assert!(orphan.is_closed());
    assert!(session.has_ended());
    assert!(map.client("client1").is_err());
    assert!(!map.client("client0").unwrap().is_closed());
}
