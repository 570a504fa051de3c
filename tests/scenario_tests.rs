use rustmemodb_unified::{
    Deployment, RunnerConfig, RunnerError, ScenarioFile, ServerInfo, UnifiedTestRunner,
};
use serde_json::{Value, json};

fn entities() -> Value {
    json!([
        {"client": {"id": "client0", "observeEvents": ["commandStartedEvent", "commandSucceededEvent", "commandFailedEvent"]}},
        {"database": {"id": "db0", "client": "client0", "databaseName": "test"}},
        {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}}
    ])
}

fn file(operations: Value, outcome: Value) -> Value {
    json!({
        "description": "scenario tests",
        "schemaVersion": "1.9",
        "createEntities": entities(),
        "initialData": [{"collectionName": "coll", "databaseName": "test", "documents": [{"_id": 1, "x": 11}, {"_id": 2, "x": 22}]}],
        "tests": [{"description": "case", "operations": operations, "outcome": outcome}]
    })
}

fn run_file(file: Value, async_mode: bool) -> Result<(), RunnerError> {
    let scenario = ScenarioFile::from_json(&file.to_string())?.scenarios(async_mode).remove(0);
    let mut runner = UnifiedTestRunner::new(
        Deployment::new(ServerInfo::default()),
        RunnerConfig::default(),
    );
    runner.run(&scenario)
}

fn insert_three() -> Value {
    json!([{
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"document": {"_id": 3, "x": 33}},
        "expectResult": {"insertedId": 3}
    }])
}

#[test]
fn test_insert_outcome_matches() {
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"_id": 1, "x": 11}, {"_id": 2, "x": 22}, {"_id": 3, "x": 33}
    ]}]);
    run_file(file(insert_three(), outcome.clone()), false).unwrap();
    run_file(file(insert_three(), outcome), true).unwrap();
}

#[test]
fn test_stale_outcome_fails() {
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"_id": 1, "x": 11}, {"_id": 2, "x": 22}
    ]}]);
    let err = run_file(file(insert_three(), outcome), false).unwrap_err();
    assert!(err.is_assertion(), "unexpected error: {}", err);
}

#[test]
fn test_outcome_ignores_document_order() {
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"x": 33, "_id": 3}, {"_id": 1, "x": 11}, {"_id": 2, "x": 22}
    ]}]);
    run_file(file(insert_three(), outcome), false).unwrap();
}

#[test]
fn test_crud_results() {
    let operations = json!([
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {"x": {"$gt": 15}}},
            "expectResult": [{"_id": 2, "x": 22}]
        },
        {
            "name": "updateOne",
            "object": "coll0",
            "arguments": {"filter": {"_id": 1}, "update": {"$inc": {"x": 1}}},
            "expectResult": {"matchedCount": 1, "modifiedCount": 1, "upsertedCount": 0}
        },
        {
            "name": "deleteOne",
            "object": "coll0",
            "arguments": {"filter": {"_id": 2}},
            "expectResult": {"deletedCount": 1}
        },
        {
            "name": "countDocuments",
            "object": "coll0",
            "arguments": {"filter": {}},
            "expectResult": 1
        }
    ]);
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [{"_id": 1, "x": 12}]}]);
    run_file(file(operations.clone(), outcome.clone()), false).unwrap();
    run_file(file(operations, outcome), true).unwrap();
}

#[test]
fn test_result_mismatch_is_assertion() {
    let operations = json!([{
        "name": "find",
        "object": "coll0",
        "arguments": {"filter": {"_id": 1}},
        "expectResult": [{"_id": 1, "x": 99}]
    }]);
    let err = run_file(file(operations, json!([])), false).unwrap_err();
    assert!(err.is_assertion());
}

#[test]
fn test_unknown_argument_is_format_error() {
    let operations = json!([{
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"document": {"_id": 3}, "bogus": true}
    }]);
    match run_file(file(operations, json!([])), false) {
        Err(RunnerError::Format(message)) => assert!(message.contains("bogus")),
        other => panic!("expected a format error, got {:?}", other),
    }
}

#[test]
fn test_save_result_and_match_entity() {
    let operations = json!([
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {"_id": 2}},
            "saveResultAsEntity": "found"
        },
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {"x": 22}},
            "expectResult": {"$$matchesEntity": "found"}
        }
    ]);
    run_file(file(operations, json!([])), false).unwrap();
}

#[test]
fn test_expect_error_on_duplicate_key() {
    let operations = json!([{
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"document": {"_id": 1}},
        "expectError": {"errorCode": 11000, "isClientError": false}
    }]);
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"_id": 1, "x": 11}, {"_id": 2, "x": 22}
    ]}]);
    run_file(file(operations, outcome), false).unwrap();
}

#[test]
fn test_unexpected_error_fails() {
    let operations = json!([{
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"document": {"_id": 1}}
    }]);
    let err = run_file(file(operations, json!([])), false).unwrap_err();
    assert!(matches!(err, RunnerError::Service(_)));
}

#[test]
fn test_ignore_result_and_error() {
    let operations = json!([{
        "name": "insertOne",
        "object": "coll0",
        "arguments": {"document": {"_id": 1}},
        "ignoreResultAndError": true
    }]);
    run_file(file(operations, json!([])), false).unwrap();
}

#[test]
fn test_expected_command_events() {
    let mut file = file(insert_three(), json!([]));
    file["tests"][0]["expectEvents"] = json!([{
        "client": "client0",
        "events": [
            {"commandStartedEvent": {
                "commandName": "insert",
                "databaseName": "test",
                "command": {"insert": "coll", "documents": [{"_id": 3, "x": 33}]}
            }},
            {"commandSucceededEvent": {"commandName": "insert"}}
        ]
    }]);
    run_file(file.clone(), false).unwrap();

    file["tests"][0]["expectEvents"][0]["events"] = json!([
        {"commandStartedEvent": {"commandName": "update"}},
        {"commandSucceededEvent": {"commandName": "update"}}
    ]);
    assert!(run_file(file, false).unwrap_err().is_assertion());
}

#[test]
fn test_retried_write_after_fail_point() {
    let operations = json!([
        {
            "name": "failPoint",
            "object": "testRunner",
            "arguments": {
                "client": "client0",
                "failPoint": {
                    "configureFailPoint": "failCommand",
                    "mode": {"times": 1},
                    "data": {"failCommands": ["insert"], "errorCode": 11600}
                }
            }
        },
        {
            "name": "insertOne",
            "object": "coll0",
            "arguments": {"document": {"_id": 3, "x": 33}}
        }
    ]);
    let mut file = file(operations, json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"_id": 1, "x": 11}, {"_id": 2, "x": 22}, {"_id": 3, "x": 33}
    ]}]));
    file["tests"][0]["expectEvents"] = json!([{
        "client": "client0",
        "events": [
            {"commandStartedEvent": {"commandName": "insert"}},
            {"commandFailedEvent": {"commandName": "insert"}},
            {"commandStartedEvent": {"commandName": "insert"}},
            {"commandSucceededEvent": {"commandName": "insert"}}
        ]
    }]);
    run_file(file, false).unwrap();
}

#[test]
fn test_fail_point_error_is_matched() {
    let operations = json!([
        {
            "name": "failPoint",
            "object": "testRunner",
            "arguments": {
                "client": "client0",
                "failPoint": {
                    "configureFailPoint": "failCommand",
                    "mode": {"times": 1},
                    "data": {"failCommands": ["find"], "errorCode": 2}
                }
            }
        },
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {}},
            "expectError": {"errorCode": 2, "errorCodeName": "BadValue"}
        },
        {
            "name": "find",
            "object": "coll0",
            "arguments": {"filter": {"_id": 1}},
            "expectResult": [{"_id": 1, "x": 11}]
        }
    ]);
    run_file(file(operations, json!([])), true).unwrap();
}

#[test]
fn test_unmet_requirements_skip() {
    let mut file = file(insert_three(), json!([]));
    file["runOnRequirements"] = json!([{"minServerVersion": "99.0"}]);
    assert!(run_file(file.clone(), false).unwrap_err().is_skip());

    file["runOnRequirements"] = json!([{"topologies": ["single"]}, {"topologies": ["replicaset"]}]);
    run_file(file, false).unwrap();
}

#[test]
fn test_collection_assertions() {
    let operations = json!([
        {
            "name": "assertCollectionExists",
            "object": "testRunner",
            "arguments": {"databaseName": "test", "collectionName": "coll"}
        },
        {
            "name": "createCollection",
            "object": "db0",
            "arguments": {"collection": "other"}
        },
        {
            "name": "assertCollectionExists",
            "object": "testRunner",
            "arguments": {"databaseName": "test", "collectionName": "other"}
        },
        {
            "name": "dropCollection",
            "object": "db0",
            "arguments": {"collection": "other"}
        },
        {
            "name": "assertCollectionNotExists",
            "object": "testRunner",
            "arguments": {"databaseName": "test", "collectionName": "other"}
        }
    ]);
    run_file(file(operations, json!([])), false).unwrap();
}

#[test]
fn test_change_stream_sees_insert() {
    let operations = json!([
        {
            "name": "createChangeStream",
            "object": "coll0",
            "arguments": {"pipeline": []},
            "saveResultAsEntity": "stream0"
        },
        {
            "name": "insertOne",
            "object": "coll0",
            "arguments": {"document": {"_id": 3, "x": 33}}
        },
        {
            "name": "iterateUntilDocumentOrError",
            "object": "stream0",
            "expectResult": {
                "operationType": "insert",
                "ns": {"db": "test", "coll": "coll"},
                "fullDocument": {"_id": 3, "x": 33}
            }
        }
    ]);
    run_file(file(operations.clone(), json!([])), false).unwrap();
    run_file(file(operations, json!([])), true).unwrap();
}

#[test]
fn test_find_cursor_iteration() {
    let operations = json!([
        {
            "name": "createFindCursor",
            "object": "coll0",
            "arguments": {"filter": {}, "sort": {"_id": 1}, "batchSize": 1},
            "saveResultAsEntity": "cursor0"
        },
        {"name": "iterateUntilDocumentOrError", "object": "cursor0", "expectResult": {"_id": 1, "x": 11}},
        {"name": "iterateUntilDocumentOrError", "object": "cursor0", "expectResult": {"_id": 2, "x": 22}},
        {"name": "close", "object": "cursor0"}
    ]);
    run_file(file(operations, json!([])), false).unwrap();
}

#[test]
fn test_run_on_thread() {
    let mut file = file(
        json!([
            {
                "name": "runOnThread",
                "object": "testRunner",
                "arguments": {
                    "thread": "thread0",
                    "operation": {"name": "insertOne", "object": "coll0", "arguments": {"document": {"_id": 3, "x": 33}}}
                }
            },
            {"name": "waitForThread", "object": "testRunner", "arguments": {"thread": "thread0"}}
        ]),
        json!([{"collectionName": "coll", "databaseName": "test", "documents": [
            {"_id": 1, "x": 11}, {"_id": 2, "x": 22}, {"_id": 3, "x": 33}
        ]}]),
    );
    file["createEntities"]
        .as_array_mut()
        .unwrap()
        .push(json!({"thread": {"id": "thread0"}}));
    run_file(file.clone(), false).unwrap();
    run_file(file, true).unwrap();
}

#[test]
fn test_failure_on_thread_surfaces_at_wait() {
    let mut file = file(
        json!([
            {
                "name": "runOnThread",
                "object": "testRunner",
                "arguments": {
                    "thread": "thread0",
                    "operation": {
                        "name": "find",
                        "object": "coll0",
                        "arguments": {"filter": {}},
                        "expectResult": []
                    }
                }
            },
            {"name": "waitForThread", "object": "testRunner", "arguments": {"thread": "thread0"}}
        ]),
        json!([]),
    );
    file["createEntities"]
        .as_array_mut()
        .unwrap()
        .push(json!({"thread": {"id": "thread0"}}));
    assert!(run_file(file, false).is_err());
}

#[test]
fn test_gridfs_upload_and_download() {
    let file = json!({
        "description": "gridfs",
        "schemaVersion": "1.0",
        "createEntities": [
            {"client": {"id": "client0"}},
            {"database": {"id": "db0", "client": "client0", "databaseName": "files"}},
            {"bucket": {"id": "bucket0", "database": "db0"}}
        ],
        "tests": [{
            "description": "roundtrip",
            "operations": [
                {
                    "name": "upload",
                    "object": "bucket0",
                    "arguments": {"filename": "a.bin", "source": {"$$hexBytes": "11223344"}, "chunkSizeBytes": 3},
                    "expectResult": {"$$type": "objectId"}
                },
                {
                    "name": "downloadByName",
                    "object": "bucket0",
                    "arguments": {"filename": "a.bin"},
                    "expectResult": {"$$matchesHexBytes": "11223344"}
                },
                {
                    "name": "downloadByName",
                    "object": "bucket0",
                    "arguments": {"filename": "missing.bin"},
                    "expectError": {"isClientError": true}
                }
            ]
        }]
    });
    run_file(file.clone(), false).unwrap();
    run_file(file, true).unwrap();
}

#[test]
fn test_key_vault_operations() {
    let file = json!({
        "description": "key vault",
        "schemaVersion": "1.8",
        "createEntities": [
            {"client": {"id": "client0"}},
            {"clientEncryption": {"id": "ce0", "clientEncryptionOpts": {
                "keyVaultClient": "client0",
                "keyVaultNamespace": "keyvault.datakeys",
                "kmsProviders": {"local": {}}
            }}}
        ],
        "tests": [{
            "description": "create and list",
            "operations": [
                {
                    "name": "createDataKey",
                    "object": "ce0",
                    "arguments": {"kmsProvider": "local", "opts": {"keyAltNames": ["alt0"]}},
                    "expectResult": {"$$type": "binData"}
                },
                {
                    "name": "getKeyByAltName",
                    "object": "ce0",
                    "arguments": {"keyAltName": "alt0"},
                    "expectResult": {"keyAltNames": ["alt0"], "masterKey": {"provider": "local"}}
                },
                {
                    "name": "getKeys",
                    "object": "ce0",
                    "expectResult": [{"_id": {"$$type": "binData"}, "keyAltNames": ["alt0"]}]
                },
                {
                    "name": "createDataKey",
                    "object": "ce0",
                    "arguments": {"kmsProvider": "aws"},
                    "expectError": {"isClientError": true}
                }
            ]
        }]
    });
    run_file(file, false).unwrap();
}

#[test]
fn test_create_entities_mid_scenario() {
    let operations = json!([
        {
            "name": "createEntities",
            "object": "testRunner",
            "arguments": {"entities": [
                {"collection": {"id": "coll1", "database": "db0", "collectionName": "second"}}
            ]}
        },
        {
            "name": "insertOne",
            "object": "coll1",
            "arguments": {"document": {"_id": 7}}
        }
    ]);
    let outcome = json!([{"collectionName": "second", "databaseName": "test", "documents": [{"_id": 7}]}]);
    run_file(file(operations, outcome), false).unwrap();
}

#[test]
fn test_unknown_entity_is_not_found() {
    let operations = json!([{"name": "insertOne", "object": "nope", "arguments": {"document": {}}}]);
    let err = run_file(file(operations, json!([])), false).unwrap_err();
    assert!(matches!(err, RunnerError::EntityNotFound { .. }));
}

#[test]
fn test_find_without_matches_returns_empty_list() {
    let operations = json!([{
        "name": "find",
        "object": "coll0",
        "arguments": {"filter": {"_id": 99}},
        "expectResult": []
    }]);
    let outcome = json!([{"collectionName": "coll", "databaseName": "test", "documents": [
        {"_id": 1, "x": 11}, {"_id": 2, "x": 22}
    ]}]);
    run_file(file(operations.clone(), outcome.clone()), false).unwrap();
    run_file(file(operations, outcome), true).unwrap();
}

#[test]
fn test_saving_onto_taken_id_fails() {
    let save = |name: &str| {
        json!({
            "name": name,
            "object": "coll0",
            "arguments": {"filter": {}, "batchSize": 1},
            "saveResultAsEntity": "saved"
        })
    };
    for async_mode in [false, true] {
        let err = run_file(file(json!([save("find"), save("find")]), json!([])), async_mode).unwrap_err();
        assert!(matches!(err, RunnerError::EntityExists(ref id) if id == "saved"), "unexpected error: {}", err);
    }
    let err = run_file(file(json!([save("find"), save("createFindCursor")]), json!([])), false).unwrap_err();
    assert!(matches!(err, RunnerError::EntityExists(_)));
}

#[test]
fn test_rejected_cursor_is_killed() {
    let file = json!({
        "description": "duplicate cursor",
        "schemaVersion": "1.9",
        "createEntities": [
            {"client": {"id": "client0", "storeEventsAsEntities": [
                {"id": "started", "events": ["commandStartedEvent"]}
            ]}},
            {"database": {"id": "db0", "client": "client0", "databaseName": "test"}},
            {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}}
        ],
        "initialData": [{"collectionName": "coll", "databaseName": "test", "documents": [{"_id": 1}, {"_id": 2}]}],
        "tests": [{
            "description": "case",
            "operations": [
                {
                    "name": "createFindCursor",
                    "object": "coll0",
                    "arguments": {"filter": {}, "batchSize": 1},
                    "saveResultAsEntity": "cursor0"
                },
                {
                    "name": "createFindCursor",
                    "object": "coll0",
                    "arguments": {"filter": {}, "batchSize": 1},
                    "saveResultAsEntity": "cursor0"
                }
            ]
        }]
    });
    let scenario = ScenarioFile::from_json(&file.to_string()).unwrap().scenarios(false).remove(0);
    let mut runner = UnifiedTestRunner::new(
        Deployment::new(ServerInfo::default()),
        RunnerConfig::default(),
    );
    assert!(matches!(runner.run(&scenario), Err(RunnerError::EntityExists(_))));

    let started = runner.entities().unwrap().result("started").unwrap();
    let names: Vec<&str> = started
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["commandName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["find", "find", "killCursors"]);
}
