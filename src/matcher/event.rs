use super::value::ValueMatcher;
use crate::core::{Document, Result, RunnerError};
use crate::entity::EntityMap;
use crate::service::{EventCategory, ServiceEvent};
use serde::Deserialize;
use serde_json::{Value, json};

/// One entry of `expectEvents`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpectedEventsForClient {
    pub client: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub ignore_extra_events: bool,
    pub events: Vec<Document>,
}

impl ExpectedEventsForClient {
    pub fn category(&self) -> Result<EventCategory> {
        match self.event_type.as_deref() {
            None | Some("command") => Ok(EventCategory::Command),
            Some("cmap") => Ok(EventCategory::Cmap),
            Some(other) => Err(RunnerError::format(format!("Unknown eventType '{}'", other))),
        }
    }
}

/// Split `{<eventName>: {fields}}` into its name and fields.
pub fn parse_expected_event(expected: &Document) -> Result<(&str, Value)> {
    if expected.len() != 1 {
        return Err(RunnerError::format(format!(
            "Expected event must have exactly one key: {:?}",
            expected
        )));
    }
    let (name, fields) = expected
        .iter()
        .next()
        .ok_or_else(|| RunnerError::format("Empty expected event"))?;
    Ok((name.as_str(), with_root_bodies(fields.clone())))
}

/// Command and reply bodies compare like root documents.
fn with_root_bodies(mut fields: Value) -> Value {
    if let Value::Object(map) = &mut fields {
        for key in ["command", "reply"] {
            if let Some(body) = map.get_mut(key) {
                if body.is_object() {
                    *body = json!({"$$matchAsRoot": body.take()});
                }
            }
        }
    }
    fields
}

/// True if `actual` is the named event and its fields match.
pub fn event_matches(
    matcher: &dyn ValueMatcher,
    actual: &ServiceEvent,
    expected: &Document,
) -> Result<bool> {
    let (name, fields) = parse_expected_event(expected)?;
    if actual.type_name() != name {
        return Ok(false);
    }
    match matcher.assert_values_match(Some(&Value::Object(actual.to_document())), &fields) {
        Ok(()) => Ok(true),
        Err(err) if err.is_assertion() => Ok(false),
        Err(err) => Err(err),
    }
}

fn assert_event(
    matcher: &dyn ValueMatcher,
    actual: &ServiceEvent,
    expected: &Document,
    index: usize,
) -> Result<()> {
    let (name, fields) = parse_expected_event(expected)?;
    if actual.type_name() != name {
        return Err(RunnerError::assertion(format!(
            "event {}: expected {}, got {}",
            index,
            name,
            actual.type_name()
        )));
    }
    matcher
        .assert_values_match(Some(&Value::Object(actual.to_document())), &fields)
        .map_err(|err| match err {
            RunnerError::Assertion(message) => {
                RunnerError::assertion(format!("event {} ({}): {}", index, name, message))
            }
            other => other,
        })
}

/// Compare the events captured for each client with the expectation.
pub fn assert_events(
    entities: &EntityMap,
    matcher: &dyn ValueMatcher,
    expectations: &[ExpectedEventsForClient],
) -> Result<()> {
    for expectation in expectations {
        let category = expectation.category()?;
        let actual: Vec<ServiceEvent> = entities
            .capturer(&expectation.client)?
            .events()?
            .into_iter()
            .filter(|event| event.category() == category)
            .collect();

        let count_ok = if expectation.ignore_extra_events {
            actual.len() >= expectation.events.len()
        } else {
            actual.len() == expectation.events.len()
        };
        if !count_ok {
            let names: Vec<&str> = actual.iter().map(ServiceEvent::type_name).collect();
            return Err(RunnerError::assertion(format!(
                "client '{}': expected {} events, got {}: {:?}",
                expectation.client,
                expectation.events.len(),
                actual.len(),
                names
            )));
        }
        for (index, (event, expected)) in actual.iter().zip(&expectation.events).enumerate() {
            assert_event(matcher, event, expected, index)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::UnifiedValueMatcher;

    fn started(name: &str, command: Value) -> ServiceEvent {
        ServiceEvent::CommandStarted {
            command_name: name.to_string(),
            database_name: "db".to_string(),
            command: command.as_object().cloned().unwrap(),
            request_id: 1,
            connection_id: 1,
        }
    }

    #[test]
    fn test_event_matches_by_name_and_fields() {
        let matcher = UnifiedValueMatcher::new();
        let event = started("insert", json!({"insert": "coll", "documents": [{"_id": 1}]}));
        let expected = json!({"commandStartedEvent": {"commandName": "insert", "command": {"insert": "coll"}}});
        assert!(event_matches(&matcher, &event, expected.as_object().unwrap()).unwrap());

        let other = json!({"commandSucceededEvent": {}});
        assert!(!event_matches(&matcher, &event, other.as_object().unwrap()).unwrap());
    }

    #[test]
    fn test_expected_event_needs_single_key() {
        let expected = json!({"a": {}, "b": {}});
        assert!(parse_expected_event(expected.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_unknown_event_type() {
        let expectation: ExpectedEventsForClient =
            serde_json::from_value(json!({"client": "c", "eventType": "sdam", "events": []})).unwrap();
        assert!(expectation.category().is_err());
    }
}
