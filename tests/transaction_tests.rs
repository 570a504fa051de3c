use rustmemodb_unified::{
    Deployment, RunnerConfig, RunnerError, ScenarioFile, ServerInfo, Topology, UnifiedTestRunner,
};
use serde_json::{Value, json};

fn run(
    operations: Value,
    outcome: Value,
    info: ServerInfo,
    async_mode: bool,
) -> Result<(), RunnerError> {
    let file = json!({
        "description": "transactions",
        "schemaVersion": "1.3",
        "createEntities": [
            {"client": {"id": "client0", "observeEvents": ["commandStartedEvent"]}},
            {"database": {"id": "db0", "client": "client0", "databaseName": "tx"}},
            {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}},
            {"session": {"id": "session0", "client": "client0"}}
        ],
        "initialData": [{"collectionName": "coll", "databaseName": "tx", "documents": [{"_id": 1}]}],
        "tests": [{"description": "case", "operations": operations, "outcome": outcome}]
    });
    let scenario = ScenarioFile::from_json(&file.to_string())?.scenarios(async_mode).remove(0);
    let mut runner = UnifiedTestRunner::new(Deployment::new(info), RunnerConfig::default());
    runner.run(&scenario)
}

fn outcome(ids: &[i64]) -> Value {
    let documents: Vec<Value> = ids.iter().map(|id| json!({"_id": id})).collect();
    json!([{"collectionName": "coll", "databaseName": "tx", "documents": documents}])
}

fn state(expected: &str) -> Value {
    json!({
        "name": "assertSessionTransactionState",
        "object": "testRunner",
        "arguments": {"session": "session0", "state": expected}
    })
}

fn insert_in_session(id: i64) -> Value {
    json!({
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"session": "session0", "document": {"_id": id}}
    })
}

#[test]
fn test_commit_publishes_writes() {
    let operations = json!([
        state("none"),
        {"name": "startTransaction", "object": "session0"},
        state("starting"),
        insert_in_session(2),
        state("in_progress"),
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {}},
            "expectResult": [{"_id": 1}]
        },
        {"name": "commitTransaction", "object": "session0"},
        state("committed")
    ]);
    run(operations.clone(), outcome(&[1, 2]), ServerInfo::default(), false).unwrap();
    run(operations, outcome(&[1, 2]), ServerInfo::default(), true).unwrap();
}

#[test]
fn test_abort_discards_writes() {
    let operations = json!([
        {"name": "startTransaction", "object": "session0"},
        insert_in_session(2),
        insert_in_session(3),
        {"name": "abortTransaction", "object": "session0"},
        state("aborted")
    ]);
    run(operations, outcome(&[1]), ServerInfo::default(), false).unwrap();
}

#[test]
fn test_with_transaction_runs_callback() {
    let operations = json!([{
        "name": "withTransaction",
        "object": "session0",
        "arguments": {"callback": [insert_in_session(2), insert_in_session(3)]}
    }]);
    run(operations.clone(), outcome(&[1, 2, 3]), ServerInfo::default(), false).unwrap();
    run(operations, outcome(&[1, 2, 3]), ServerInfo::default(), true).unwrap();
}

#[test]
fn test_with_transaction_surfaces_callback_error() {
    let operations = json!([{
        "name": "withTransaction",
        "object": "session0",
        "arguments": {"callback": [insert_in_session(2), insert_in_session(1)]},
        "expectError": {"errorCode": 11000}
    }]);
    run(operations, outcome(&[1]), ServerInfo::default(), false).unwrap();
}

#[test]
fn test_commands_in_transaction_carry_session_lsid() {
    let operations = json!([
        {"name": "startTransaction", "object": "session0"},
        insert_in_session(2),
        {"name": "commitTransaction", "object": "session0"}
    ]);
    let file = json!({
        "description": "transactions",
        "schemaVersion": "1.3",
        "createEntities": [
            {"client": {"id": "client0", "observeEvents": ["commandStartedEvent"]}},
            {"database": {"id": "db0", "client": "client0", "databaseName": "tx"}},
            {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}},
            {"session": {"id": "session0", "client": "client0"}}
        ],
        "tests": [{
            "description": "lsid",
            "operations": operations,
            "expectEvents": [{
                "client": "client0",
                "events": [
                    {"commandStartedEvent": {
                        "commandName": "insert",
                        "command": {"lsid": {"$$sessionLsid": "session0"}, "startTransaction": true, "autocommit": false}
                    }},
                    {"commandStartedEvent": {
                        "commandName": "commitTransaction",
                        "command": {"lsid": {"$$sessionLsid": "session0"}, "autocommit": false}
                    }}
                ]
            }]
        }]
    });
    let scenario = ScenarioFile::from_json(&file.to_string()).unwrap().scenarios(false).remove(0);
    let mut runner = UnifiedTestRunner::new(
        Deployment::new(ServerInfo::default()),
        RunnerConfig::default(),
    );
    runner.run(&scenario).unwrap();
}

#[test]
fn test_standalone_rejects_transactions() {
    let operations = json!([{
        "name": "startTransaction",
        "object": "session0",
        "expectError": {"isClientError": true, "errorContains": "not supported"}
    }]);
    let info = ServerInfo::default().topology(Topology::Single);
    run(operations, outcome(&[1]), info, false).unwrap();
}
