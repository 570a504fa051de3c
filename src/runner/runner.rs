// ============================================================================
// Scenario Runner
// ============================================================================
//
// Drives one scenario end to end:
//
//   schema check -> requirements -> kill sessions -> entities -> seed data
//     -> operations -> expected events -> expected outcome
//
// A runner is single-shot. Its entity map stays readable after `run` so
// callers can inspect saved results; `dispose` (or drop) tears it down.
//
// ============================================================================

use super::config::RunnerConfig;
use super::dispatcher::OperationDispatcher;
use super::requirements::{parse_server_version, unmet_reason};
use super::scenario::{CollectionData, Scenario};
use crate::core::document::documents_equal;
use crate::core::{Document, Result, RunnerError, compare_values};
use crate::entity::{EntityMap, EntityMapBuilder, parse_descriptors};
use crate::matcher::{UnifiedValueMatcher, ValueMatcher, assert_events};
use crate::operations::{OperationContext, OperationRunner, parse_operations};
use crate::service::{Client, ClientOptions, Deployment, InsertManyOptions, Namespace};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Running,
    Finished,
}

pub struct UnifiedTestRunner {
    deployment: Arc<Deployment>,
    config: Arc<RunnerConfig>,
    loop_cancel: CancellationToken,
    state: RunnerState,
    entities: Option<Arc<EntityMap>>,
    runtime: Option<tokio::runtime::Runtime>,
    disposed: bool,
}

fn by_id(left: &Document, right: &Document) -> Ordering {
    compare_values(
        left.get("_id").unwrap_or(&Value::Null),
        right.get("_id").unwrap_or(&Value::Null),
    )
}

impl UnifiedTestRunner {
    pub fn new(deployment: Arc<Deployment>, config: RunnerConfig) -> Self {
        Self {
            deployment,
            config: Arc::new(config),
            loop_cancel: CancellationToken::new(),
            state: RunnerState::NotStarted,
            entities: None,
            runtime: None,
            disposed: false,
        }
    }

    /// Signal that ends every `loop` operation of the scenario.
    pub fn with_loop_cancellation(mut self, token: CancellationToken) -> Self {
        self.loop_cancel = token;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Entities of the last run, until `dispose`.
    pub fn entities(&self) -> Option<&Arc<EntityMap>> {
        self.entities.as_ref()
    }

    pub fn run(&mut self, scenario: &Scenario) -> Result<()> {
        if self.state != RunnerState::NotStarted {
            return Err(RunnerError::InvalidState(
                "a scenario runner can only run once".to_string(),
            ));
        }
        self.state = RunnerState::Running;
        info!(scenario = %scenario.name(), "Running");
        let outcome = self.run_steps(scenario);
        self.state = RunnerState::Finished;
        match &outcome {
            Ok(()) => info!(scenario = %scenario.name(), "Passed"),
            Err(err) if err.is_skip() => {
                info!(scenario = %scenario.name(), reason = %err, "Skipped")
            }
            Err(err) => warn!(scenario = %scenario.name(), error = %err, "Failed"),
        }
        outcome
    }

    fn run_steps(&mut self, scenario: &Scenario) -> Result<()> {
        let version = parse_server_version(&scenario.schema_version)?;
        if !self.config.supports_schema(&version) {
            return Err(RunnerError::format(format!(
                "Unsupported schema version {} (supported {} to {})",
                scenario.schema_version,
                self.config.min_schema_version,
                self.config.max_schema_version
            )));
        }

        let info = self.deployment.info();
        for requirements in [&scenario.file_requirements, &scenario.test_requirements] {
            if let Some(reason) = unmet_reason(requirements, info)? {
                return Err(RunnerError::Skipped(reason));
            }
        }
        if let Some(reason) = &scenario.skip_reason {
            return Err(RunnerError::Skipped(reason.clone()));
        }

        self.deployment.kill_all_sessions();

        let descriptors = parse_descriptors(&scenario.entities)?;
        let entities = Arc::new(
            EntityMapBuilder::new(self.deployment.clone(), &self.config).build(&descriptors)?,
        );
        self.entities = Some(entities.clone());
        let matcher: Arc<dyn ValueMatcher> =
            Arc::new(UnifiedValueMatcher::with_entities(entities.clone()));

        self.seed(&scenario.initial_data)?;

        let operations = parse_operations(&scenario.operations)?;
        let dispatcher = OperationDispatcher::new(OperationContext {
            entities: entities.clone(),
            config: self.config.clone(),
            matcher: matcher.clone(),
            loop_cancel: self.loop_cancel.clone(),
        });
        if scenario.async_mode {
            let runtime = self.runtime()?;
            for operation in &operations {
                let cancel = CancellationToken::new();
                runtime.block_on(dispatcher.run_operation_async(operation, &cancel))?;
            }
        } else {
            for operation in &operations {
                dispatcher.run_operation(operation, &CancellationToken::new())?;
            }
        }

        debug!("Asserting events");
        assert_events(&entities, matcher.as_ref(), &scenario.expect_events)?;

        debug!("Asserting outcome");
        for expected in &scenario.outcome {
            self.assert_outcome(expected)?;
        }
        Ok(())
    }

    fn runtime(&mut self) -> Result<&tokio::runtime::Runtime> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("unified-runner")
                .build()
                .map_err(|err| {
                    RunnerError::InvalidState(format!("cannot start runtime: {}", err))
                })?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| RunnerError::InvalidState("runtime unavailable".to_string()))
    }

    /// Client used for seeding and teardown; it has no event capturer.
    fn internal_client(&self) -> Client {
        Client::new(self.deployment.clone(), ClientOptions::default())
    }

    fn seed(&self, initial_data: &[CollectionData]) -> Result<()> {
        let client = self.internal_client();
        let cancel = CancellationToken::new();
        for data in initial_data {
            debug!(
                database = %data.database_name,
                collection = %data.collection_name,
                documents = data.documents.len(),
                "Seeding collection"
            );
            let database = client.database(&data.database_name);
            database.drop_collection(&data.collection_name, None, &cancel)?;
            database.create_collection(
                &data.collection_name,
                data.create_options.clone().unwrap_or_default(),
                None,
                &cancel,
            )?;
            if !data.documents.is_empty() {
                database.collection(&data.collection_name).insert_many(
                    data.documents.clone(),
                    InsertManyOptions::default(),
                    None,
                    &cancel,
                )?;
            }
        }
        client.close();
        Ok(())
    }

    fn assert_outcome(&self, expected: &CollectionData) -> Result<()> {
        let namespace = Namespace::new(
            expected.database_name.clone(),
            expected.collection_name.clone(),
        );
        let mut actual = self.deployment.snapshot()?.all_documents(&namespace);
        actual.sort_by(by_id);
        let mut wanted = expected.documents.clone();
        wanted.sort_by(by_id);

        if actual.len() != wanted.len() {
            return Err(RunnerError::assertion(format!(
                "{}: expected {} documents, found {}",
                namespace,
                wanted.len(),
                actual.len()
            )));
        }
        for (index, (found, want)) in actual.iter().zip(&wanted).enumerate() {
            if !documents_equal(found, want) {
                return Err(RunnerError::assertion(format!(
                    "{}: document {} is {}, expected {}",
                    namespace,
                    index,
                    Value::Object(found.clone()),
                    Value::Object(want.clone())
                )));
            }
        }
        Ok(())
    }

    /// Tear down: kill open transactions, drop the databases entities
    /// addressed, dispose the entity map and switch off fail points.
    /// Every step is best-effort.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        debug!("Disposing");
        self.deployment.kill_all_sessions();

        if let Some(entities) = self.entities.take() {
            match entities.database_names() {
                Ok(names) => {
                    let client = self.internal_client();
                    let cancel = CancellationToken::new();
                    for name in names {
                        if let Err(err) = client.database(&name).drop(None, &cancel) {
                            warn!(database = %name, error = %err, "Failed to drop database");
                        }
                    }
                    client.close();
                }
                Err(err) => warn!(error = %err, "Cannot list entity databases"),
            }
            entities.dispose();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for UnifiedTestRunner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::scenario::ScenarioFile;
    use crate::service::ServerInfo;

    fn scenario(body: &str) -> Scenario {
        ScenarioFile::from_json(body).unwrap().scenarios(false).remove(0)
    }

    #[test]
    fn test_runs_only_once() {
        let s = scenario(r#"{"description": "f", "schemaVersion": "1.0", "tests": [{"description": "t", "operations": []}]}"#);
        let mut runner = UnifiedTestRunner::new(
            Deployment::new(ServerInfo::default()),
            RunnerConfig::default(),
        );
        runner.run(&s).unwrap();
        assert_eq!(runner.state(), RunnerState::Finished);
        assert!(matches!(runner.run(&s), Err(RunnerError::InvalidState(_))));
    }

    #[test]
    fn test_schema_version_out_of_range() {
        let s = scenario(r#"{"description": "f", "schemaVersion": "2.0", "tests": [{"description": "t", "operations": []}]}"#);
        let mut runner = UnifiedTestRunner::new(
            Deployment::new(ServerInfo::default()),
            RunnerConfig::default(),
        );
        assert!(matches!(runner.run(&s), Err(RunnerError::Format(_))));
    }

    #[test]
    fn test_skip_reason_skips() {
        let s = scenario(
            r#"{"description": "f", "schemaVersion": "1.0", "tests": [{"description": "t", "skipReason": "later", "operations": []}]}"#,
        );
        let mut runner = UnifiedTestRunner::new(
            Deployment::new(ServerInfo::default()),
            RunnerConfig::default(),
        );
        assert!(runner.run(&s).unwrap_err().is_skip());
    }
}
