// ============================================================================
// Event Capture
// ============================================================================

use crate::core::Result;
use crate::service::events::is_sensitive_command;
use crate::service::{EventListener, ServiceEvent};
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::warn;

/// Which events a capturer keeps.
#[derive(Debug, Clone, Default)]
pub struct CaptureFilter {
    event_types: HashSet<String>,
    ignored_commands: HashSet<String>,
    observe_sensitive: bool,
}

impl CaptureFilter {
    pub fn new(event_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn ignore_commands(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignored_commands.extend(names);
        self
    }

    pub fn observe_sensitive(mut self, observe: bool) -> Self {
        self.observe_sensitive = observe;
        self
    }

    /// The event as it should be stored, or `None` if it is filtered out.
    fn admit(&self, event: &ServiceEvent) -> Option<ServiceEvent> {
        if !self.event_types.contains(event.type_name()) {
            return None;
        }
        let Some(name) = event.command_name() else {
            return Some(event.clone());
        };
        if self.ignored_commands.contains(name) {
            return None;
        }
        let sensitive = match event {
            ServiceEvent::CommandStarted { command, .. } => is_sensitive_command(name, command),
            _ => is_sensitive_command(name, &Default::default()),
        };
        match (sensitive, self.observe_sensitive) {
            (false, _) => Some(event.clone()),
            (true, true) => Some(event.redacted()),
            (true, false) => None,
        }
    }
}

/// Append-only event log. Readers take an O(1) snapshot and never block
/// writers for longer than that clone.
#[derive(Debug, Default)]
pub struct EventCapturer {
    filter: CaptureFilter,
    events: RwLock<im::Vector<ServiceEvent>>,
}

impl EventCapturer {
    pub fn new(filter: CaptureFilter) -> Self {
        Self {
            filter,
            events: RwLock::new(im::Vector::new()),
        }
    }

    pub fn events(&self) -> Result<im::Vector<ServiceEvent>> {
        Ok(self.events.read()?.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.events.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl EventListener for EventCapturer {
    fn handle(&self, event: &ServiceEvent) {
        let Some(event) = self.filter.admit(event) else {
            return;
        };
        match self.events.write() {
            Ok(mut events) => events.push_back(event),
            Err(err) => warn!(error = %err, "Dropping captured event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Document;

    fn started(name: &str) -> ServiceEvent {
        ServiceEvent::CommandStarted {
            command_name: name.to_string(),
            database_name: "db".to_string(),
            command: Document::new(),
            request_id: 1,
            connection_id: 1,
        }
    }

    #[test]
    fn test_filter_by_type_and_command() {
        let filter = CaptureFilter::new(vec!["commandStartedEvent".to_string()])
            .ignore_commands(vec!["hello".to_string()]);
        let capturer = EventCapturer::new(filter);
        capturer.handle(&started("insert"));
        capturer.handle(&started("hello"));
        capturer.handle(&ServiceEvent::PoolCreated);
        assert_eq!(capturer.len().unwrap(), 1);
    }

    #[test]
    fn test_sensitive_commands_need_opt_in() {
        let types = vec!["commandStartedEvent".to_string()];
        let hidden = EventCapturer::new(CaptureFilter::new(types.clone()));
        hidden.handle(&started("saslStart"));
        assert!(hidden.is_empty().unwrap());

        let shown = EventCapturer::new(CaptureFilter::new(types).observe_sensitive(true));
        shown.handle(&started("saslStart"));
        assert_eq!(shown.len().unwrap(), 1);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_appends() {
        let capturer = EventCapturer::new(CaptureFilter::new(vec!["poolCreatedEvent".to_string()]));
        capturer.handle(&ServiceEvent::PoolCreated);
        let snapshot = capturer.events().unwrap();
        capturer.handle(&ServiceEvent::PoolCreated);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(capturer.len().unwrap(), 2);
    }
}
