// ============================================================================
// RustMemDB Unified Runner
// ============================================================================

pub mod core;
pub mod entity;
pub mod matcher;
pub mod operations;
pub mod runner;
pub mod service;

// Re-export main types for convenience
pub use core::{Document, Result, RunnerError};
pub use entity::{EntityKind, EntityMap, EntityMapBuilder};
pub use matcher::{UnifiedValueMatcher, ValueMatcher};
pub use operations::{OperationDescriptor, OperationFactory, OperationResult};
pub use runner::{RunnerConfig, Scenario, ScenarioFile, UnifiedTestRunner};
pub use service::{Deployment, ServerInfo, ServiceError, Topology};

/// Parse a scenario file and run every test in it against a fresh runner.
///
/// Skipped tests are reported as skipped and do not fail the file.
///
/// # Examples
///
/// ```
/// use rustmemodb_unified::{Deployment, RunnerConfig, ServerInfo, run_scenario_file};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let file = r#"{
///     "description": "insert",
///     "schemaVersion": "1.0",
///     "createEntities": [
///         {"client": {"id": "client0"}},
///         {"database": {"id": "db0", "client": "client0", "databaseName": "test"}},
///         {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}}
///     ],
///     "initialData": [{"collectionName": "coll", "databaseName": "test", "documents": []}],
///     "tests": [{
///         "description": "insertOne",
///         "operations": [{
///             "name": "insertOne",
///             "object": "coll0",
///             "arguments": {"document": {"_id": 1}},
///             "expectResult": {"insertedId": 1}
///         }],
///         "outcome": [{"collectionName": "coll", "databaseName": "test", "documents": [{"_id": 1}]}]
///     }]
/// }"#;
///
/// let deployment = Deployment::new(ServerInfo::default());
/// let summary = run_scenario_file(&deployment, RunnerConfig::default(), file, false)?;
/// assert_eq!(summary.passed, 1);
/// # Ok(())
/// # }
/// ```
pub fn run_scenario_file(
    deployment: &std::sync::Arc<Deployment>,
    config: RunnerConfig,
    json: &str,
    async_mode: bool,
) -> Result<RunSummary> {
    let file = ScenarioFile::from_json(json)?;
    let mut summary = RunSummary::default();
    for scenario in file.scenarios(async_mode) {
        let mut runner = UnifiedTestRunner::new(deployment.clone(), config.clone());
        match runner.run(&scenario) {
            Ok(()) => summary.passed += 1,
            Err(err) if err.is_skip() => summary.skipped += 1,
            Err(err) => return Err(err),
        }
    }
    Ok(summary)
}

/// Outcome counts of `run_scenario_file`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub skipped: usize,
}
