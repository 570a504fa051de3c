use super::descriptor::OperationDescriptor;
use super::{
    Operation, OperationContext, bucket, client, collection, cursor, database, encryption, session,
    test_runner,
};
use crate::core::{Result, RunnerError};
use crate::entity::{EntityKind, TEST_RUNNER_ID};
use tracing::trace;

/// Turns operation descriptors into executable handlers.
///
/// Dispatch is two-level: the target id picks an entity kind, then the
/// kind's handler module matches the operation name and parses arguments.
pub struct OperationFactory<'a> {
    ctx: &'a OperationContext,
}

impl<'a> OperationFactory<'a> {
    pub fn new(ctx: &'a OperationContext) -> Self {
        Self { ctx }
    }

    pub fn create(&self, descriptor: &OperationDescriptor) -> Result<Operation> {
        let name = descriptor.name.as_str();
        let target = descriptor.object.as_str();
        let arguments = descriptor.arguments.clone().unwrap_or_default();

        let kind = if target == TEST_RUNNER_ID {
            EntityKind::TestRunner
        } else {
            self.ctx.entities.kind_of(target)?
        };
        trace!(operation = name, target, kind = %kind, "Creating operation");

        match kind {
            EntityKind::TestRunner => test_runner::create(name, arguments, self.ctx),
            EntityKind::Client => client::create(name, target, arguments, self.ctx),
            EntityKind::Database => database::create(name, target, arguments, self.ctx),
            EntityKind::Collection => collection::create(name, target, arguments, self.ctx),
            EntityKind::Session => session::create(name, target, arguments, self.ctx),
            EntityKind::Cursor | EntityKind::ChangeStream => {
                cursor::create(name, target, kind, arguments, self.ctx)
            }
            EntityKind::Bucket => bucket::create(name, target, arguments, self.ctx),
            EntityKind::ClientEncryption => encryption::create(name, target, arguments, self.ctx),
            EntityKind::Thread | EntityKind::Result => Err(RunnerError::format(format!(
                "Entity '{}' of kind {} does not support operation '{}'",
                target, kind, name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMap;
    use crate::matcher::UnifiedValueMatcher;
    use crate::runner::config::RunnerConfig;
    use crate::service::{Deployment, ServerInfo};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context() -> OperationContext {
        let entities = Arc::new(EntityMap::new(Deployment::new(ServerInfo::default())));
        OperationContext {
            matcher: Arc::new(UnifiedValueMatcher::with_entities(entities.clone())),
            entities,
            config: Arc::new(RunnerConfig::default()),
            loop_cancel: CancellationToken::new(),
        }
    }

    fn descriptor(value: serde_json::Value) -> OperationDescriptor {
        OperationDescriptor::from_value(&value).unwrap()
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let ctx = context();
        let err = OperationFactory::new(&ctx)
            .create(&descriptor(json!({"name": "find", "object": "nowhere"})))
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::EntityNotFound { .. }));
    }

    #[test]
    fn test_test_runner_operations() {
        let ctx = context();
        let factory = OperationFactory::new(&ctx);
        let op = factory
            .create(&descriptor(json!({"name": "wait", "object": "testRunner", "arguments": {"ms": 1}})))
            .unwrap();
        assert!(matches!(op, Operation::Special(_)));

        let err = factory
            .create(&descriptor(json!({"name": "explode", "object": "testRunner"})))
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Format(_)));

        let err = factory
            .create(&descriptor(json!({"name": "wait", "object": "testRunner", "arguments": {"ms": 1, "seconds": 2}})))
            .err()
            .unwrap();
        assert!(err.to_string().contains("seconds"));
    }

    #[test]
    fn test_result_entities_take_no_operations() {
        let ctx = context();
        ctx.entities.save_result("saved", json!(1)).unwrap();
        let err = OperationFactory::new(&ctx)
            .create(&descriptor(json!({"name": "close", "object": "saved"})))
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Format(_)));
    }
}
