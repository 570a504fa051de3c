//! Scenario files, run requirements and the runner that executes them.

pub mod config;
pub mod dispatcher;
pub mod requirements;
#[allow(clippy::module_inception)]
pub mod runner;
pub mod scenario;

pub use config::RunnerConfig;
pub use dispatcher::OperationDispatcher;
pub use requirements::RunOnRequirement;
pub use runner::{RunnerState, UnifiedTestRunner};
pub use scenario::{CollectionData, Scenario, ScenarioFile, TestCase};
