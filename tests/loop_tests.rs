use rustmemodb_unified::{Deployment, RunnerConfig, ScenarioFile, ServerInfo, UnifiedTestRunner};
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loop_file(loop_arguments: Value) -> String {
    json!({
        "description": "loop",
        "schemaVersion": "1.2",
        "createEntities": [
            {"client": {"id": "client0"}},
            {"database": {"id": "db0", "client": "client0", "databaseName": "test"}},
            {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}}
        ],
        "initialData": [{"collectionName": "coll", "databaseName": "test", "documents": [{"_id": 1}]}],
        "tests": [{
            "description": "loop until cancelled",
            "operations": [{"name": "loop", "object": "testRunner", "arguments": loop_arguments}]
        }]
    })
    .to_string()
}

/// Run the scenario, cancelling its loops after `after`, and return the runner
/// so saved entities can be inspected.
fn run_cancelled(file: &str, after: Duration, async_mode: bool) -> UnifiedTestRunner {
    let scenario = ScenarioFile::from_json(file).unwrap().scenarios(async_mode).remove(0);
    let token = CancellationToken::new();
    let deployment = Deployment::new(ServerInfo::default());
    let mut runner = UnifiedTestRunner::new(deployment, RunnerConfig::default())
        .with_loop_cancellation(token.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(after);
        token.cancel();
    });
    runner.run(&scenario).unwrap();
    canceller.join().unwrap();
    runner
}

fn saved(runner: &UnifiedTestRunner, id: &str) -> Value {
    runner.entities().unwrap().result(id).unwrap()
}

#[test]
fn test_loop_counts_successes_and_iterations() {
    init_tracing();
    let file = loop_file(json!({
        "operations": [
            {"name": "find", "object": "coll0", "arguments": {"filter": {}}, "expectResult": [{"_id": 1}]},
            {"name": "countDocuments", "object": "coll0", "arguments": {"filter": {}}, "expectResult": 1}
        ],
        "storeSuccessesAsEntity": "successes",
        "storeIterationsAsEntity": "iterations"
    }));
    let runner = run_cancelled(&file, Duration::from_millis(100), false);

    let iterations = saved(&runner, "iterations").as_u64().unwrap();
    let successes = saved(&runner, "successes").as_u64().unwrap();
    assert!(iterations > 0);
    assert_eq!(successes, 2 * iterations);
}

#[test]
fn test_loop_records_failures_and_errors() {
    init_tracing();
    let file = loop_file(json!({
        "operations": [
            {"name": "find", "object": "coll0", "arguments": {"filter": {}}, "expectResult": [{"_id": 2}]}
        ],
        "storeErrorsAsEntity": "errors",
        "storeFailuresAsEntity": "failures",
        "storeIterationsAsEntity": "iterations"
    }));
    let runner = run_cancelled(&file, Duration::from_millis(100), false);

    let failures = saved(&runner, "failures");
    let failures = failures.as_array().unwrap();
    assert!(!failures.is_empty());
    assert!(failures[0]["error"].is_string());
    assert!(failures[0]["time"].is_number());
    assert!(saved(&runner, "errors").as_array().unwrap().is_empty());
    assert_eq!(saved(&runner, "iterations").as_u64().unwrap() as usize, failures.len());
}

#[test]
fn test_loop_routes_everything_to_errors_without_failure_list() {
    init_tracing();
    let file = loop_file(json!({
        "operations": [
            {"name": "insertOne", "object": "coll0", "arguments": {"document": {"_id": 1}}}
        ],
        "storeErrorsAsEntity": "errors"
    }));
    let runner = run_cancelled(&file, Duration::from_millis(50), true);
    let errors = saved(&runner, "errors");
    assert!(!errors.as_array().unwrap().is_empty());
    assert!(errors[0]["error"].as_str().unwrap().contains("11000"));
}

#[test]
fn test_loop_without_targets_stops_on_first_error() {
    init_tracing();
    let file = loop_file(json!({
        "operations": [
            {"name": "find", "object": "coll0", "arguments": {"filter": {}}, "expectResult": []}
        ]
    }));
    let scenario = ScenarioFile::from_json(&file).unwrap().scenarios(false).remove(0);
    let mut runner = UnifiedTestRunner::new(
        Deployment::new(ServerInfo::default()),
        RunnerConfig::default(),
    );
    assert!(runner.run(&scenario).unwrap_err().is_assertion());
}
