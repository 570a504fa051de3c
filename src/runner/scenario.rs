use super::requirements::RunOnRequirement;
use crate::core::{Document, Result, RunnerError};
use crate::matcher::ExpectedEventsForClient;
use serde::Deserialize;
use serde_json::Value;

/// Documents of one collection, used both to seed and to check outcomes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollectionData {
    pub collection_name: String,
    pub database_name: String,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub create_options: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestCase {
    pub description: String,
    #[serde(default)]
    pub run_on_requirements: Vec<RunOnRequirement>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    pub operations: Vec<Value>,
    #[serde(default)]
    pub expect_events: Vec<ExpectedEventsForClient>,
    #[serde(default)]
    pub outcome: Vec<CollectionData>,
}

/// A scenario file: shared setup plus a list of tests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioFile {
    pub description: String,
    pub schema_version: String,
    #[serde(default)]
    pub run_on_requirements: Vec<RunOnRequirement>,
    #[serde(default)]
    pub create_entities: Vec<Value>,
    #[serde(default)]
    pub initial_data: Vec<CollectionData>,
    pub tests: Vec<TestCase>,
    #[serde(default, rename = "_yamlAnchors")]
    pub yaml_anchors: Option<Value>,
}

impl ScenarioFile {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| RunnerError::format(format!("Invalid scenario file: {}", err)))
    }

    /// One runnable scenario per test, in file order.
    pub fn scenarios(&self, async_mode: bool) -> Vec<Scenario> {
        self.tests
            .iter()
            .map(|test| Scenario {
                file_description: self.description.clone(),
                description: test.description.clone(),
                schema_version: self.schema_version.clone(),
                file_requirements: self.run_on_requirements.clone(),
                test_requirements: test.run_on_requirements.clone(),
                skip_reason: test.skip_reason.clone(),
                entities: self.create_entities.clone(),
                initial_data: self.initial_data.clone(),
                operations: test.operations.clone(),
                expect_events: test.expect_events.clone(),
                outcome: test.outcome.clone(),
                async_mode,
            })
            .collect()
    }
}

/// Everything needed to run one test.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub file_description: String,
    pub description: String,
    pub schema_version: String,
    pub file_requirements: Vec<RunOnRequirement>,
    pub test_requirements: Vec<RunOnRequirement>,
    pub skip_reason: Option<String>,
    pub entities: Vec<Value>,
    pub initial_data: Vec<CollectionData>,
    pub operations: Vec<Value>,
    pub expect_events: Vec<ExpectedEventsForClient>,
    pub outcome: Vec<CollectionData>,
    /// Drive `execute_async` instead of `execute`.
    pub async_mode: bool,
}

impl Scenario {
    pub fn name(&self) -> String {
        format!(
            "{}: {}{}",
            self.file_description,
            self.description,
            if self.async_mode { " (async)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "description": "crud",
        "schemaVersion": "1.0",
        "createEntities": [{"client": {"id": "client0"}}],
        "initialData": [{"collectionName": "c", "databaseName": "db", "documents": [{"_id": 1}]}],
        "tests": [
            {"description": "first", "operations": []},
            {"description": "second", "skipReason": "not today", "operations": []}
        ]
    }"#;

    #[test]
    fn test_one_scenario_per_test() {
        let file = ScenarioFile::from_json(FILE).unwrap();
        let scenarios = file.scenarios(true);
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[1].skip_reason.as_deref(), Some("not today"));
        assert_eq!(scenarios[0].initial_data[0].documents.len(), 1);
        assert_eq!(scenarios[0].name(), "crud: first (async)");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = ScenarioFile::from_json(r#"{"description": "x", "schemaVersion": "1.0", "tests": [], "bogus": 1}"#)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Format(_)));
    }
}
