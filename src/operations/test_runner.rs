// ============================================================================
// Runner-level Operations
// ============================================================================
//
// Assertions over deployment state and captured events, fail point
// configuration and waits. None of these produce a result.

use super::arguments::Arguments;
use super::{Operation, OperationContext, SpecialOperation, loop_op, thread};
use crate::core::{Document, Result, RunnerError, values_equal};
use crate::entity::{EntityDescriptor, EntityMapBuilder, ThreadEntity, parse_descriptors};
use crate::matcher::event_matches;
use crate::service::{Client, ClientSession, Namespace, ServiceEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Assertions and entity creation; each completes without waiting.
enum Check {
    CollectionExists {
        namespace: Namespace,
        exists: bool,
    },
    IndexExists {
        namespace: Namespace,
        index: String,
        exists: bool,
    },
    SessionTransactionState {
        session: ClientSession,
        state: String,
    },
    SessionDirty {
        session: ClientSession,
        dirty: bool,
    },
    LsidOnLastTwoCommands {
        client: String,
        same: bool,
    },
    ConnectionsCheckedOut {
        client: Client,
        connections: usize,
    },
    EventCount {
        client: String,
        event: Document,
        count: usize,
    },
    CreateEntities {
        descriptors: Vec<EntityDescriptor>,
    },
}

enum Call {
    Check(Check),
    WaitForEvent {
        client: String,
        event: Document,
        count: usize,
    },
    FailPoint {
        client: Client,
        command: Document,
        name: String,
    },
    Wait {
        duration: Duration,
    },
    WaitForThread {
        thread: Arc<ThreadEntity>,
    },
}

pub struct TestRunnerOperation {
    ctx: OperationContext,
    call: Call,
}

fn namespace(args: &Arguments) -> Result<Namespace> {
    Ok(Namespace::new(
        args.required_string("databaseName")?,
        args.required_string("collectionName")?,
    ))
}

fn fail_point(args: &Arguments) -> Result<(Document, String)> {
    let command = args.required_document("failPoint")?;
    let name = command
        .get("configureFailPoint")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            RunnerError::format("failPoint must name the fail point in configureFailPoint")
        })?;
    Ok((command, name))
}

fn count(args: &Arguments, key: &str) -> Result<usize> {
    args.required_i64(key)?;
    Ok(args.usize(key)?.unwrap_or_default())
}

pub fn create(name: &str, arguments: Document, ctx: &OperationContext) -> Result<Operation> {
    let allowed: &[&str] = match name {
        "loop" => return loop_op::create(arguments, ctx),
        "runOnThread" => return thread::create(arguments, ctx),
        "assertCollectionExists" | "assertCollectionNotExists" => {
            &["databaseName", "collectionName"]
        }
        "assertIndexExists" | "assertIndexNotExists" => {
            &["databaseName", "collectionName", "indexName"]
        }
        "assertSessionTransactionState" => &["session", "state"],
        "assertSessionDirty" | "assertSessionNotDirty" => &["session"],
        "assertSameLsidOnLastTwoCommands" | "assertDifferentLsidOnLastTwoCommands" => &["client"],
        "assertNumberConnectionsCheckedOut" => &["client", "connections"],
        "assertEventCount" | "waitForEvent" => &["client", "event", "count"],
        "failPoint" => &["client", "failPoint"],
        "targetedFailPoint" => &["session", "failPoint"],
        "createEntities" => &["entities"],
        "wait" => &["ms"],
        "waitForThread" => &["thread"],
        other => {
            return Err(RunnerError::format(format!(
                "Unsupported testRunner operation '{}'",
                other
            )));
        }
    };
    let args = Arguments::new(name, arguments, allowed)?;
    let entities = &ctx.entities;

    let call = match name {
        "assertCollectionExists" | "assertCollectionNotExists" => {
            Call::Check(Check::CollectionExists {
                namespace: namespace(&args)?,
                exists: name == "assertCollectionExists",
            })
        }
        "assertIndexExists" | "assertIndexNotExists" => Call::Check(Check::IndexExists {
            namespace: namespace(&args)?,
            index: args.required_string("indexName")?,
            exists: name == "assertIndexExists",
        }),
        "assertSessionTransactionState" => Call::Check(Check::SessionTransactionState {
            session: entities.session(&args.required_string("session")?)?,
            state: args.required_string("state")?,
        }),
        "assertSessionDirty" | "assertSessionNotDirty" => Call::Check(Check::SessionDirty {
            session: entities.session(&args.required_string("session")?)?,
            dirty: name == "assertSessionDirty",
        }),
        "assertSameLsidOnLastTwoCommands" | "assertDifferentLsidOnLastTwoCommands" => {
            let client = args.required_string("client")?;
            entities.capturer(&client)?;
            Call::Check(Check::LsidOnLastTwoCommands {
                client,
                same: name == "assertSameLsidOnLastTwoCommands",
            })
        }
        "assertNumberConnectionsCheckedOut" => Call::Check(Check::ConnectionsCheckedOut {
            client: entities.client(&args.required_string("client")?)?,
            connections: count(&args, "connections")?,
        }),
        "assertEventCount" | "waitForEvent" => {
            let client = args.required_string("client")?;
            entities.capturer(&client)?;
            let event = args.required_document("event")?;
            let count = count(&args, "count")?;
            if name == "assertEventCount" {
                Call::Check(Check::EventCount { client, event, count })
            } else {
                Call::WaitForEvent { client, event, count }
            }
        }
        "failPoint" => {
            let (command, name) = fail_point(&args)?;
            Call::FailPoint {
                client: entities.client(&args.required_string("client")?)?,
                command,
                name,
            }
        }
        "targetedFailPoint" => {
            let (command, name) = fail_point(&args)?;
            let session = entities.session(&args.required_string("session")?)?;
            Call::FailPoint {
                client: session.client().clone(),
                command,
                name,
            }
        }
        "createEntities" => {
            let values = match args.required_value("entities")? {
                Value::Array(values) => values,
                _ => return Err(RunnerError::format("createEntities takes an array of entities")),
            };
            Call::Check(Check::CreateEntities {
                descriptors: parse_descriptors(&values)?,
            })
        }
        "wait" => {
            let ms = args.u64("ms")?.ok_or_else(|| RunnerError::format("wait requires ms"))?;
            Call::Wait {
                duration: Duration::from_millis(ms),
            }
        }
        _ => Call::WaitForThread {
            thread: entities.thread(&args.required_string("thread")?)?,
        },
    };

    Ok(Operation::Special(Box::new(TestRunnerOperation {
        ctx: ctx.clone(),
        call,
    })))
}

impl TestRunnerOperation {
    fn count_matching(&self, client: &str, expected: &Document) -> Result<usize> {
        let mut matched = 0;
        for event in self.ctx.entities.capturer(client)?.events()?.iter() {
            if event_matches(self.ctx.matcher.as_ref(), event, expected)? {
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn check(&self, check: &Check) -> Result<()> {
        match check {
            Check::CollectionExists { namespace, exists } => {
                let snapshot = self.ctx.entities.deployment().snapshot()?;
                let found = snapshot.collection(namespace).is_some();
                if found != *exists {
                    return Err(RunnerError::assertion(format!(
                        "expected collection {} to {}exist",
                        namespace,
                        if *exists { "" } else { "not " }
                    )));
                }
                Ok(())
            }
            Check::IndexExists {
                namespace,
                index,
                exists,
            } => {
                let snapshot = self.ctx.entities.deployment().snapshot()?;
                let found = match snapshot.collection(namespace) {
                    Some(_) => snapshot
                        .indexes(namespace)?
                        .iter()
                        .any(|model| &model.name == index),
                    None => false,
                };
                if found != *exists {
                    return Err(RunnerError::assertion(format!(
                        "expected index {} on {} to {}exist",
                        index,
                        namespace,
                        if *exists { "" } else { "not " }
                    )));
                }
                Ok(())
            }
            Check::SessionTransactionState { session, state } => {
                let actual = session.transaction_state()?;
                if actual.as_str() != state {
                    return Err(RunnerError::assertion(format!(
                        "expected transaction state '{}', got '{}'",
                        state,
                        actual.as_str()
                    )));
                }
                Ok(())
            }
            Check::SessionDirty { session, dirty } => {
                if session.is_dirty() != *dirty {
                    return Err(RunnerError::assertion(format!(
                        "expected session to be {}",
                        if *dirty { "dirty" } else { "clean" }
                    )));
                }
                Ok(())
            }
            Check::LsidOnLastTwoCommands { client, same } => {
                let events = self.ctx.entities.capturer(client)?.events()?;
                let lsids: Vec<Option<Value>> = events
                    .iter()
                    .rev()
                    .filter_map(|event| match event {
                        ServiceEvent::CommandStarted { command, .. } => {
                            Some(command.get("lsid").cloned())
                        }
                        _ => None,
                    })
                    .take(2)
                    .collect();
                let [Some(last), Some(previous)] = lsids.as_slice() else {
                    return Err(RunnerError::assertion(format!(
                        "client '{}' has fewer than two commands carrying an lsid",
                        client
                    )));
                };
                if values_equal(last, previous) != *same {
                    return Err(RunnerError::assertion(format!(
                        "expected {} lsids on the last two commands",
                        if *same { "identical" } else { "different" }
                    )));
                }
                Ok(())
            }
            Check::ConnectionsCheckedOut { client, connections } => {
                let actual = client.checked_out_connections();
                if actual != *connections {
                    return Err(RunnerError::assertion(format!(
                        "expected {} checked out connections, got {}",
                        connections, actual
                    )));
                }
                Ok(())
            }
            Check::EventCount { client, event, count } => {
                let actual = self.count_matching(client, event)?;
                if actual != *count {
                    return Err(RunnerError::assertion(format!(
                        "expected {} matching events for client '{}', got {}",
                        count, client, actual
                    )));
                }
                Ok(())
            }
            Check::CreateEntities { descriptors } => {
                let entities = &self.ctx.entities;
                let created = EntityMapBuilder::new(entities.deployment().clone(), &self.ctx.config)
                    .parent(entities)
                    .build(descriptors)?;
                entities.add_entities(created)
            }
        }
    }

    /// `Some` once enough events arrived, `None` to keep polling.
    fn poll_events(
        &self,
        client: &str,
        event: &Document,
        count: usize,
        started: Instant,
    ) -> Result<Option<()>> {
        if self.count_matching(client, event)? >= count {
            return Ok(Some(()));
        }
        if started.elapsed() >= self.ctx.config.wait_timeout {
            return Err(RunnerError::assertion(format!(
                "timed out after {:?} waiting for {} events matching {:?} on client '{}'",
                self.ctx.config.wait_timeout, count, event, client
            )));
        }
        Ok(None)
    }
}

#[async_trait]
impl SpecialOperation for TestRunnerOperation {
    fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        match &self.call {
            Call::WaitForEvent { client, event, count } => {
                let started = Instant::now();
                while self.poll_events(client, event, *count, started)?.is_none() {
                    if cancel.is_cancelled() {
                        return Err(RunnerError::InvalidState("waitForEvent cancelled".to_string()));
                    }
                    std::thread::sleep(self.ctx.config.poll_interval);
                }
                Ok(())
            }
            Call::FailPoint { client, command, name } => {
                debug!(fail_point = %name, "Configuring fail point");
                client.database("admin").run_command(command.clone(), None, cancel)?;
                self.ctx.entities.register_fail_point(name)
            }
            Call::Wait { duration } => {
                std::thread::sleep(*duration);
                Ok(())
            }
            Call::WaitForThread { thread } => thread.wait(),
            Call::Check(check) => self.check(check),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> Result<()> {
        match &self.call {
            Call::WaitForEvent { client, event, count } => {
                let started = Instant::now();
                while self.poll_events(client, event, *count, started)?.is_none() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                        _ = cancel.cancelled() => {
                            return Err(RunnerError::InvalidState(
                                "waitForEvent cancelled".to_string(),
                            ));
                        }
                    }
                }
                Ok(())
            }
            Call::FailPoint { client, command, name } => {
                debug!(fail_point = %name, "Configuring fail point");
                client
                    .database("admin")
                    .run_command_async(command.clone(), None, cancel)
                    .await?;
                self.ctx.entities.register_fail_point(name)
            }
            Call::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Call::WaitForThread { thread } => thread.wait_async().await,
            Call::Check(check) => {
                tokio::task::yield_now().await;
                self.check(check)
            }
        }
    }
}
