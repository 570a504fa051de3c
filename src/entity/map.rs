// ============================================================================
// Entity Map
// ============================================================================
//
// One registry per entity kind, keyed by the id chosen in the scenario file.
// Ids are unique across registries, so an id resolves to exactly one kind.
//
// ============================================================================

use super::capture::EventCapturer;
use super::thread::ThreadEntity;
use crate::core::{Document, Result, RunnerError};
use crate::service::{
    ChangeStream, Client, ClientEncryption, ClientSession, Collection, Cursor, Database, Deployment,
    GridFsBucket,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reserved id addressing runner-level operations.
pub const TEST_RUNNER_ID: &str = "testRunner";

/// Entity kinds, in the order ids are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    TestRunner,
    Bucket,
    ChangeStream,
    ClientEncryption,
    Client,
    Collection,
    Cursor,
    Database,
    Session,
    Thread,
    Result,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TestRunner => "testRunner",
            EntityKind::Bucket => "bucket",
            EntityKind::ChangeStream => "changeStream",
            EntityKind::ClientEncryption => "clientEncryption",
            EntityKind::Client => "client",
            EntityKind::Collection => "collection",
            EntityKind::Cursor => "cursor",
            EntityKind::Database => "database",
            EntityKind::Session => "session",
            EntityKind::Thread => "thread",
            EntityKind::Result => "result",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Registries {
    buckets: HashMap<String, GridFsBucket>,
    change_streams: HashMap<String, ChangeStream>,
    client_encryptions: HashMap<String, ClientEncryption>,
    clients: HashMap<String, Client>,
    collections: HashMap<String, Collection>,
    cursors: HashMap<String, Cursor>,
    databases: HashMap<String, Database>,
    sessions: HashMap<String, ClientSession>,
    threads: HashMap<String, Arc<ThreadEntity>>,
    results: HashMap<String, Value>,
    /// Event lists stored through `storeEventsAsEntities`; resolved as results.
    event_lists: HashMap<String, Arc<EventCapturer>>,
    /// Capturers keyed by the id of the client they observe.
    capturers: HashMap<String, Arc<EventCapturer>>,
    session_lsids: HashMap<String, Document>,
    fail_points: Vec<String>,
}

impl Registries {
    fn kind_of(&self, id: &str) -> Option<EntityKind> {
        if id == TEST_RUNNER_ID {
            return Some(EntityKind::TestRunner);
        }
        let kinds: [(bool, EntityKind); 10] = [
            (self.buckets.contains_key(id), EntityKind::Bucket),
            (self.change_streams.contains_key(id), EntityKind::ChangeStream),
            (self.client_encryptions.contains_key(id), EntityKind::ClientEncryption),
            (self.clients.contains_key(id), EntityKind::Client),
            (self.collections.contains_key(id), EntityKind::Collection),
            (self.cursors.contains_key(id), EntityKind::Cursor),
            (self.databases.contains_key(id), EntityKind::Database),
            (self.sessions.contains_key(id), EntityKind::Session),
            (self.threads.contains_key(id), EntityKind::Thread),
            (
                self.results.contains_key(id) || self.event_lists.contains_key(id),
                EntityKind::Result,
            ),
        ];
        kinds.into_iter().find(|(hit, _)| *hit).map(|(_, kind)| kind)
    }

    fn ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        ids.extend(self.buckets.keys().cloned());
        ids.extend(self.change_streams.keys().cloned());
        ids.extend(self.client_encryptions.keys().cloned());
        ids.extend(self.clients.keys().cloned());
        ids.extend(self.collections.keys().cloned());
        ids.extend(self.cursors.keys().cloned());
        ids.extend(self.databases.keys().cloned());
        ids.extend(self.sessions.keys().cloned());
        ids.extend(self.threads.keys().cloned());
        ids.extend(self.results.keys().cloned());
        ids.extend(self.event_lists.keys().cloned());
        ids
    }

    fn merge(&mut self, incoming: Registries) {
        self.buckets.extend(incoming.buckets);
        self.change_streams.extend(incoming.change_streams);
        self.client_encryptions.extend(incoming.client_encryptions);
        self.clients.extend(incoming.clients);
        self.collections.extend(incoming.collections);
        self.cursors.extend(incoming.cursors);
        self.databases.extend(incoming.databases);
        self.sessions.extend(incoming.sessions);
        self.threads.extend(incoming.threads);
        self.results.extend(incoming.results);
        self.event_lists.extend(incoming.event_lists);
        self.capturers.extend(incoming.capturers);
        self.session_lsids.extend(incoming.session_lsids);
        for name in incoming.fail_points {
            if !self.fail_points.contains(&name) {
                self.fail_points.push(name);
            }
        }
    }

    /// Close change streams and cursors, end sessions, close clients.
    fn release_handles(&self) {
        let cancel = CancellationToken::new();
        for (id, stream) in &self.change_streams {
            if let Err(err) = stream.close(&cancel) {
                warn!(entity = %id, error = %err, "Failed to close change stream");
            }
        }
        for (id, cursor) in &self.cursors {
            if let Err(err) = cursor.close(&cancel) {
                warn!(entity = %id, error = %err, "Failed to close cursor");
            }
        }
        for session in self.sessions.values() {
            session.end_session(&cancel);
        }
        for client in self.clients.values() {
            client.close();
        }
    }
}

fn events_value(capturer: &EventCapturer) -> Result<Value> {
    let events = capturer
        .events()?
        .iter()
        .map(|event| {
            let mut doc = event.to_document();
            doc.insert("name".to_string(), Value::String(event.type_name().to_string()));
            Value::Object(doc)
        })
        .collect();
    Ok(Value::Array(events))
}

/// Named entities of one scenario.
pub struct EntityMap {
    deployment: Arc<Deployment>,
    registries: RwLock<Registries>,
    disposed: AtomicBool,
}

macro_rules! getter {
    ($name:ident, $field:ident, $ty:ty, $kind:literal) => {
        pub fn $name(&self, id: &str) -> Result<$ty> {
            self.read(|r| {
                r.$field
                    .get(id)
                    .cloned()
                    .ok_or_else(|| RunnerError::not_found($kind, id))
            })
        }
    };
}

macro_rules! inserter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub(crate) fn $name(&self, id: &str, value: $ty) -> Result<()> {
            self.insert_unique(id, |r| {
                r.$field.insert(id.to_string(), value);
            })
        }
    };
}

impl EntityMap {
    pub fn new(deployment: Arc<Deployment>) -> Self {
        Self {
            deployment,
            registries: RwLock::new(Registries::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&Registries) -> Result<T>) -> Result<T> {
        if self.is_disposed() {
            return Err(RunnerError::Disposed);
        }
        let registries = self.registries.read()?;
        f(&registries)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Registries) -> Result<T>) -> Result<T> {
        if self.is_disposed() {
            return Err(RunnerError::Disposed);
        }
        let mut registries = self.registries.write()?;
        f(&mut registries)
    }

    fn insert_unique(&self, id: &str, put: impl FnOnce(&mut Registries)) -> Result<()> {
        self.write(|r| {
            if r.kind_of(id).is_some() {
                return Err(RunnerError::EntityExists(id.to_string()));
            }
            put(r);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Kind of the entity registered under `id`.
    pub fn kind_of(&self, id: &str) -> Result<EntityKind> {
        self.read(|r| r.kind_of(id).ok_or_else(|| RunnerError::not_found("entity", id)))
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        self.read(|r| Ok(r.kind_of(id).is_some()))
    }

    getter!(bucket, buckets, GridFsBucket, "bucket");
    getter!(change_stream, change_streams, ChangeStream, "changeStream");
    getter!(client_encryption, client_encryptions, ClientEncryption, "clientEncryption");
    getter!(client, clients, Client, "client");
    getter!(collection, collections, Collection, "collection");
    getter!(cursor, cursors, Cursor, "cursor");
    getter!(database, databases, Database, "database");
    getter!(session, sessions, ClientSession, "session");
    getter!(session_lsid, session_lsids, Document, "session");
    getter!(thread, threads, Arc<ThreadEntity>, "thread");
    getter!(capturer, capturers, Arc<EventCapturer>, "event capturer");

    /// A saved result, or the events captured into a stored event list.
    pub fn result(&self, id: &str) -> Result<Value> {
        self.read(|r| {
            if let Some(value) = r.results.get(id) {
                return Ok(value.clone());
            }
            match r.event_lists.get(id) {
                Some(capturer) => events_value(capturer),
                None => Err(RunnerError::not_found("result", id)),
            }
        })
    }

    /// Names of the databases addressed by database entities.
    pub fn database_names(&self) -> Result<Vec<String>> {
        self.read(|r| {
            let mut names: Vec<String> =
                r.databases.values().map(|db| db.name().to_string()).collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    inserter!(insert_bucket, buckets, GridFsBucket);
    inserter!(insert_client_encryption, client_encryptions, ClientEncryption);
    inserter!(insert_client, clients, Client);
    inserter!(insert_collection, collections, Collection);
    inserter!(insert_database, databases, Database);
    inserter!(insert_thread, threads, Arc<ThreadEntity>);
    inserter!(insert_event_list, event_lists, Arc<EventCapturer>);

    pub(crate) fn insert_session(&self, id: &str, session: ClientSession) -> Result<()> {
        let lsid = session.lsid().clone();
        self.insert_unique(id, |r| {
            r.sessions.insert(id.to_string(), session);
            r.session_lsids.insert(id.to_string(), lsid);
        })
    }

    /// Attach the capturer observing the client `client_id`.
    pub(crate) fn attach_capturer(
        &self,
        client_id: &str,
        capturer: Arc<EventCapturer>,
    ) -> Result<()> {
        self.write(|r| {
            r.capturers.insert(client_id.to_string(), capturer);
            Ok(())
        })
    }

    /// Save a named result. Ids are single-assignment across every kind.
    pub fn save_result(&self, id: &str, value: Value) -> Result<()> {
        self.insert_unique(id, |r| {
            r.results.insert(id.to_string(), value);
        })
    }

    /// Save a live cursor; a rejected cursor is closed before the error returns.
    pub fn save_cursor(&self, id: &str, cursor: Cursor) -> Result<()> {
        let saved = cursor.clone();
        let outcome = self.insert_unique(id, |r| {
            r.cursors.insert(id.to_string(), saved);
        });
        if outcome.is_err() {
            if let Err(err) = cursor.close(&CancellationToken::new()) {
                warn!(entity = %id, error = %err, "Failed to close rejected cursor");
            }
        }
        outcome
    }

    pub fn save_change_stream(&self, id: &str, stream: ChangeStream) -> Result<()> {
        let saved = stream.clone();
        let outcome = self.insert_unique(id, |r| {
            r.change_streams.insert(id.to_string(), saved);
        });
        if outcome.is_err() {
            if let Err(err) = stream.close(&CancellationToken::new()) {
                warn!(entity = %id, error = %err, "Failed to close rejected change stream");
            }
        }
        outcome
    }

    /// Remember a fail point so disposal can switch it off.
    pub fn register_fail_point(&self, name: &str) -> Result<()> {
        self.write(|r| {
            if !r.fail_points.iter().any(|fp| fp == name) {
                r.fail_points.push(name.to_string());
            }
            Ok(())
        })
    }

    /// Move every entity of `other` into this map. Nothing is moved if any id
    /// is already taken; the rejected entities are released instead.
    pub fn add_entities(&self, other: EntityMap) -> Result<()> {
        let mut pending = Some(other.into_registries()?);
        let outcome = self.write(|r| {
            let clash = pending
                .as_ref()
                .and_then(|incoming| incoming.ids().into_iter().find(|id| r.kind_of(id).is_some()));
            if let Some(id) = clash {
                return Err(RunnerError::EntityExists(id));
            }
            if let Some(incoming) = pending.take() {
                r.merge(incoming);
            }
            Ok(())
        });
        if let Some(rejected) = pending {
            debug!("Releasing entities rejected by the merge");
            rejected.release_handles();
        }
        outcome
    }

    fn into_registries(self) -> Result<Registries> {
        if self.is_disposed() {
            return Err(RunnerError::Disposed);
        }
        self.disposed.store(true, Ordering::SeqCst);
        let mut registries = self.registries.write()?;
        Ok(std::mem::take(&mut *registries))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release every entity. Safe to call more than once; errors are logged
    /// and swallowed.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let registries = match self.registries.write() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(err) => {
                warn!(error = %err, "Entity map lock poisoned during dispose");
                return;
            }
        };
        debug!("Disposing entity map");
        registries.release_handles();
        for name in &registries.fail_points {
            if let Err(err) = self.deployment.disable_fail_point(name) {
                warn!(fail_point = %name, error = %err, "Failed to disable fail point");
            }
        }
    }
}

impl Drop for EntityMap {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ClientOptions, ServerInfo, SessionOptions};
    use serde_json::json;

    fn map_with_client() -> EntityMap {
        let deployment = Deployment::new(ServerInfo::default());
        let map = EntityMap::new(deployment.clone());
        map.insert_client("client0", Client::new(deployment, ClientOptions::default()))
            .unwrap();
        map
    }

    #[test]
    fn test_typed_getters_check_kind() {
        let map = map_with_client();
        assert!(map.client("client0").is_ok());
        assert!(matches!(
            map.collection("client0"),
            Err(RunnerError::EntityNotFound { kind: "collection", .. })
        ));
        assert_eq!(map.kind_of("client0").unwrap(), EntityKind::Client);
        assert_eq!(map.kind_of(TEST_RUNNER_ID).unwrap(), EntityKind::TestRunner);
    }

    #[test]
    fn test_ids_are_unique_across_kinds() {
        let map = map_with_client();
        let client = map.client("client0").unwrap();
        let db = client.database("db");
        assert!(matches!(
            map.insert_database("client0", db.clone()),
            Err(RunnerError::EntityExists(_))
        ));
        map.save_result("r", json!(1)).unwrap();
        assert!(matches!(map.save_result("r", json!(2)), Err(RunnerError::EntityExists(_))));
        assert_eq!(map.result("r").unwrap(), json!(1));
        assert!(map.save_result("client0", json!(3)).is_err());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let map = map_with_client();
        let client = map.client("client0").unwrap();
        let session = client.start_session(SessionOptions::default()).unwrap();
        map.insert_session("session0", session.clone()).unwrap();
        map.dispose();
        map.dispose();
        assert!(client.is_closed());
        assert!(session.has_ended());
        assert!(matches!(map.client("client0"), Err(RunnerError::Disposed)));
    }

    #[test]
    fn test_add_entities_rejects_collisions_atomically() {
        let map = map_with_client();
        let deployment = map.deployment().clone();
        let other = EntityMap::new(deployment.clone());
        other
            .insert_client("client1", Client::new(deployment.clone(), ClientOptions::default()))
            .unwrap();
        other
            .insert_client("client0", Client::new(deployment.clone(), ClientOptions::default()))
            .unwrap();
        assert!(matches!(map.add_entities(other), Err(RunnerError::EntityExists(_))));
        assert!(map.client("client1").is_err());

        let other = EntityMap::new(deployment.clone());
        other
            .insert_client("client1", Client::new(deployment, ClientOptions::default()))
            .unwrap();
        map.add_entities(other).unwrap();
        assert!(map.client("client1").is_ok());
    }
}
