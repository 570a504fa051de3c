// ============================================================================
// Monitoring Events
// ============================================================================

use super::error::ServiceError;
use crate::core::Document;
use serde_json::Value;
use std::time::Duration;

/// Commands whose bodies are redacted unless sensitive commands are observed.
pub const SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Command,
    Cmap,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    CommandStarted {
        command_name: String,
        database_name: String,
        command: Document,
        request_id: i64,
        connection_id: u64,
    },
    CommandSucceeded {
        command_name: String,
        database_name: String,
        reply: Document,
        request_id: i64,
        duration: Duration,
    },
    CommandFailed {
        command_name: String,
        database_name: String,
        failure: ServiceError,
        request_id: i64,
        duration: Duration,
    },
    PoolCreated,
    PoolReady,
    PoolCleared,
    PoolClosed,
    ConnectionCreated { connection_id: u64 },
    ConnectionReady { connection_id: u64 },
    ConnectionClosed { connection_id: u64, reason: String },
    ConnectionCheckOutStarted,
    ConnectionCheckOutFailed { reason: String },
    ConnectionCheckedOut { connection_id: u64 },
    ConnectionCheckedIn { connection_id: u64 },
}

impl ServiceEvent {
    /// Event name as written in scenario files (`commandStartedEvent`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceEvent::CommandStarted { .. } => "commandStartedEvent",
            ServiceEvent::CommandSucceeded { .. } => "commandSucceededEvent",
            ServiceEvent::CommandFailed { .. } => "commandFailedEvent",
            ServiceEvent::PoolCreated => "poolCreatedEvent",
            ServiceEvent::PoolReady => "poolReadyEvent",
            ServiceEvent::PoolCleared => "poolClearedEvent",
            ServiceEvent::PoolClosed => "poolClosedEvent",
            ServiceEvent::ConnectionCreated { .. } => "connectionCreatedEvent",
            ServiceEvent::ConnectionReady { .. } => "connectionReadyEvent",
            ServiceEvent::ConnectionClosed { .. } => "connectionClosedEvent",
            ServiceEvent::ConnectionCheckOutStarted => "connectionCheckOutStartedEvent",
            ServiceEvent::ConnectionCheckOutFailed { .. } => "connectionCheckOutFailedEvent",
            ServiceEvent::ConnectionCheckedOut { .. } => "connectionCheckedOutEvent",
            ServiceEvent::ConnectionCheckedIn { .. } => "connectionCheckedInEvent",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            ServiceEvent::CommandStarted { .. }
            | ServiceEvent::CommandSucceeded { .. }
            | ServiceEvent::CommandFailed { .. } => EventCategory::Command,
            _ => EventCategory::Cmap,
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        match self {
            ServiceEvent::CommandStarted { command_name, .. }
            | ServiceEvent::CommandSucceeded { command_name, .. }
            | ServiceEvent::CommandFailed { command_name, .. } => Some(command_name),
            _ => None,
        }
    }

    /// Copy of this event with the command or reply body cleared.
    pub fn redacted(&self) -> Self {
        let mut event = self.clone();
        match &mut event {
            ServiceEvent::CommandStarted { command, .. } => command.clear(),
            ServiceEvent::CommandSucceeded { reply, .. } => reply.clear(),
            _ => {}
        }
        event
    }

    /// Fields comparable against an expected event.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        let mut put = |key: &str, value: Value| {
            doc.insert(key.to_string(), value);
        };
        match self {
            ServiceEvent::CommandStarted {
                command_name,
                database_name,
                command,
                ..
            } => {
                put("command", Value::Object(command.clone()));
                put("commandName", Value::String(command_name.clone()));
                put("databaseName", Value::String(database_name.clone()));
            }
            ServiceEvent::CommandSucceeded {
                command_name,
                database_name,
                reply,
                ..
            } => {
                put("reply", Value::Object(reply.clone()));
                put("commandName", Value::String(command_name.clone()));
                put("databaseName", Value::String(database_name.clone()));
            }
            ServiceEvent::CommandFailed {
                command_name,
                database_name,
                ..
            } => {
                put("commandName", Value::String(command_name.clone()));
                put("databaseName", Value::String(database_name.clone()));
            }
            ServiceEvent::PoolCleared => put("hasServiceId", Value::Bool(false)),
            ServiceEvent::ConnectionClosed { reason, .. }
            | ServiceEvent::ConnectionCheckOutFailed { reason } => {
                put("reason", Value::String(reason.clone()));
            }
            _ => {}
        }
        doc
    }
}

/// Receives every event a client emits.
pub trait EventListener: Send + Sync {
    fn handle(&self, event: &ServiceEvent);
}

pub fn is_sensitive_command(name: &str, command: &Document) -> bool {
    SENSITIVE_COMMANDS.contains(&name)
        || (matches!(name, "hello" | "isMaster") && command.contains_key("speculativeAuthenticate"))
}
