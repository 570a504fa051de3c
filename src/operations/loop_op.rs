use super::arguments::Arguments;
use super::descriptor::{OperationDescriptor, parse_operations};
use super::result::OperationResult;
use super::{CallbackOperation, Operation, OperationContext, OperationRunner};
use crate::core::{Document, Result, RunnerError};
use crate::entity::EntityMap;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where a loop publishes its accumulated state.
#[derive(Debug, Clone, Default)]
pub struct LoopTargets {
    pub errors: Option<String>,
    pub failures: Option<String>,
    pub successes: Option<String>,
    pub iterations: Option<String>,
}

/// Counters and captured problems of one loop run.
#[derive(Debug, Default)]
pub struct LoopState {
    pub iterations: u64,
    pub successes: u64,
    pub errors: Vec<Value>,
    pub failures: Vec<Value>,
}

impl LoopState {
    /// File `err` under errors or failures. Assertion mismatches prefer the
    /// failure list, everything else the error list; with only one list
    /// configured it takes both. Returns `err` back when neither is.
    fn record(&mut self, targets: &LoopTargets, err: RunnerError) -> Result<()> {
        let entry = json!({
            "error": err.to_string(),
            "time": chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        });
        let as_failure = match (err.is_assertion(), &targets.failures, &targets.errors) {
            (_, None, None) => return Err(err),
            (true, Some(_), _) | (false, Some(_), None) => true,
            _ => false,
        };
        if as_failure {
            self.failures.push(entry);
        } else {
            self.errors.push(entry);
        }
        Ok(())
    }

    /// Save the configured entities once, when the loop ends. An id named for
    /// both lists receives both.
    fn publish(self, targets: &LoopTargets, entities: &EntityMap) -> Result<()> {
        match (&targets.errors, &targets.failures) {
            (Some(errors), Some(failures)) if errors == failures => {
                let mut all = self.errors;
                all.extend(self.failures);
                entities.save_result(errors, Value::Array(all))?;
            }
            (errors, failures) => {
                if let Some(id) = errors {
                    entities.save_result(id, Value::Array(self.errors))?;
                }
                if let Some(id) = failures {
                    entities.save_result(id, Value::Array(self.failures))?;
                }
            }
        }
        if let Some(id) = &targets.successes {
            entities.save_result(id, Value::from(self.successes))?;
        }
        if let Some(id) = &targets.iterations {
            entities.save_result(id, Value::from(self.iterations))?;
        }
        Ok(())
    }
}

/// Repeats its operations until the loop cancellation signal fires.
pub struct LoopOperation {
    operations: Vec<OperationDescriptor>,
    targets: LoopTargets,
    entities: Arc<EntityMap>,
    stop: CancellationToken,
}

pub fn create(arguments: Document, ctx: &OperationContext) -> Result<Operation> {
    let args = Arguments::new(
        "loop",
        arguments,
        &[
            "operations",
            "storeErrorsAsEntity",
            "storeFailuresAsEntity",
            "storeSuccessesAsEntity",
            "storeIterationsAsEntity",
        ],
    )?;
    let operations = match args.required_value("operations")? {
        Value::Array(items) => parse_operations(&items)?,
        _ => return Err(RunnerError::format("loop operations must be an array")),
    };
    let targets = LoopTargets {
        errors: args.string("storeErrorsAsEntity")?,
        failures: args.string("storeFailuresAsEntity")?,
        successes: args.string("storeSuccessesAsEntity")?,
        iterations: args.string("storeIterationsAsEntity")?,
    };
    Ok(Operation::Callback(Box::new(LoopOperation {
        operations,
        targets,
        entities: ctx.entities.clone(),
        stop: ctx.loop_cancel.clone(),
    })))
}

impl LoopOperation {
    fn finish(&self, state: LoopState, outcome: Result<()>) -> Result<OperationResult> {
        info!(
            iterations = state.iterations,
            successes = state.successes,
            errors = state.errors.len(),
            failures = state.failures.len(),
            "Loop finished"
        );
        state.publish(&self.targets, &self.entities)?;
        outcome.map(|()| OperationResult::Empty)
    }
}

#[async_trait]
impl CallbackOperation for LoopOperation {
    fn execute(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let mut state = LoopState::default();
        while !self.stop.is_cancelled() {
            // Handlers may mutate their input, so every iteration gets a fresh copy.
            for operation in self.operations.clone() {
                match runner.run_operation(&operation, cancel) {
                    Ok(()) => state.successes += 1,
                    Err(err) => {
                        debug!(error = %err, operation = %operation.name, "Loop operation failed");
                        if let Err(err) = state.record(&self.targets, err) {
                            return self.finish(state, Err(err));
                        }
                        break;
                    }
                }
            }
            state.iterations += 1;
        }
        self.finish(state, Ok(()))
    }

    async fn execute_async(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let mut state = LoopState::default();
        while !self.stop.is_cancelled() {
            for operation in self.operations.clone() {
                match runner.run_operation_async(&operation, cancel).await {
                    Ok(()) => state.successes += 1,
                    Err(err) => {
                        debug!(error = %err, operation = %operation.name, "Loop operation failed");
                        if let Err(err) = state.record(&self.targets, err) {
                            return self.finish(state, Err(err));
                        }
                        break;
                    }
                }
            }
            state.iterations += 1;
            tokio::task::yield_now().await;
        }
        self.finish(state, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(errors: bool, failures: bool) -> LoopTargets {
        LoopTargets {
            errors: errors.then(|| "errors".to_string()),
            failures: failures.then(|| "failures".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_routing_prefers_matching_list() {
        let mut state = LoopState::default();
        let both = targets(true, true);
        state.record(&both, RunnerError::assertion("mismatch")).unwrap();
        state.record(&both, RunnerError::InvalidState("boom".to_string())).unwrap();
        assert_eq!(state.failures.len(), 1);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0]["error"].as_str().unwrap().contains("boom"));
        assert!(state.errors[0]["time"].is_f64());
    }

    #[test]
    fn test_single_list_takes_everything() {
        let mut state = LoopState::default();
        let errors_only = targets(true, false);
        state.record(&errors_only, RunnerError::assertion("mismatch")).unwrap();
        assert_eq!(state.errors.len(), 1);

        let mut state = LoopState::default();
        let failures_only = targets(false, true);
        state.record(&failures_only, RunnerError::InvalidState("boom".to_string())).unwrap();
        assert_eq!(state.failures.len(), 1);
    }

    #[test]
    fn test_unrouted_error_is_returned() {
        let mut state = LoopState::default();
        let err = state
            .record(&targets(false, false), RunnerError::assertion("mismatch"))
            .unwrap_err();
        assert!(err.is_assertion());
    }

    #[test]
    fn test_shared_target_receives_both_lists() {
        use crate::service::{Deployment, ServerInfo};

        let entities = EntityMap::new(Deployment::new(ServerInfo::default()));
        let shared = LoopTargets {
            errors: Some("problems".to_string()),
            failures: Some("problems".to_string()),
            ..Default::default()
        };
        let mut state = LoopState::default();
        state.record(&shared, RunnerError::assertion("mismatch")).unwrap();
        state.record(&shared, RunnerError::InvalidState("boom".to_string())).unwrap();
        state.publish(&shared, &entities).unwrap();
        assert_eq!(entities.result("problems").unwrap().as_array().unwrap().len(), 2);
    }
}
