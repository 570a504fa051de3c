//! Operation handlers and the factory that selects them.
//!
//! Every handler has a blocking `execute` and an `execute_async` twin that
//! issue the same service call and produce the same result shape.

use crate::core::Result;
use crate::entity::EntityMap;
use crate::matcher::ValueMatcher;
use crate::runner::config::RunnerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod arguments;
pub mod bucket;
pub mod client;
pub mod collection;
pub mod cursor;
pub mod database;
pub mod descriptor;
pub mod encryption;
pub mod factory;
pub mod loop_op;
pub mod result;
pub mod session;
pub mod test_runner;
pub mod thread;
pub mod transaction;

pub use arguments::Arguments;
pub use descriptor::{OperationDescriptor, parse_operations};
pub use factory::OperationFactory;
pub use loop_op::LoopOperation;
pub use result::{IntoOperationResult, OperationResult};

/// Operation against a live entity. Service failures come back as
/// `OperationResult::Error`, never as `Err`.
#[async_trait]
pub trait EntityOperation: Send + Sync {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult;

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult;
}

/// Runner-level operation with no result; assertion failures are `Err`.
#[async_trait]
pub trait SpecialOperation: Send + Sync {
    fn execute(&self, cancel: &CancellationToken) -> Result<()>;

    async fn execute_async(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Operation that runs nested operations through `runner`.
#[async_trait]
pub trait CallbackOperation: Send + Sync {
    fn execute(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult>;

    async fn execute_async(
        &self,
        runner: Arc<dyn OperationRunner>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult>;
}

/// Runs one operation descriptor end to end, assertions included.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    fn run_operation(
        &self,
        operation: &OperationDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn run_operation_async(
        &self,
        operation: &OperationDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

pub enum Operation {
    Entity(Box<dyn EntityOperation>),
    Special(Box<dyn SpecialOperation>),
    Callback(Box<dyn CallbackOperation>),
}

/// What handlers may reach while they are built.
#[derive(Clone)]
pub struct OperationContext {
    pub entities: Arc<EntityMap>,
    pub config: Arc<RunnerConfig>,
    pub matcher: Arc<dyn ValueMatcher>,
    /// Signal that ends `loop` operations.
    pub loop_cancel: CancellationToken,
}
