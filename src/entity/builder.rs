// ============================================================================
// Entity Builder
// ============================================================================
//
// Builds an `EntityMap` from the `createEntities` list. Descriptors are
// processed in order; a reference must name an entity built earlier (or one
// already present in the parent map when building mid-scenario).
//
// ============================================================================

use super::capture::{CaptureFilter, EventCapturer};
use super::map::EntityMap;
use super::thread::ThreadEntity;
use crate::core::{Document, Result, RunnerError, into_document};
use crate::runner::config::RunnerConfig;
use crate::service::{
    Client, ClientEncryption, ClientEncryptionOptions, ClientOptions, Deployment, GridFsBucket,
    GridFsOptions, SessionOptions, TransactionOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityDescriptor {
    Client(ClientDescriptor),
    Database(DatabaseDescriptor),
    Collection(CollectionDescriptor),
    Session(SessionDescriptor),
    Bucket(BucketDescriptor),
    ClientEncryption(ClientEncryptionDescriptor),
    Thread(ThreadDescriptor),
}

impl EntityDescriptor {
    pub fn id(&self) -> &str {
        match self {
            EntityDescriptor::Client(d) => &d.id,
            EntityDescriptor::Database(d) => &d.id,
            EntityDescriptor::Collection(d) => &d.id,
            EntityDescriptor::Session(d) => &d.id,
            EntityDescriptor::Bucket(d) => &d.id,
            EntityDescriptor::ClientEncryption(d) => &d.id,
            EntityDescriptor::Thread(d) => &d.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientDescriptor {
    pub id: String,
    #[serde(default)]
    pub uri_options: UriOptions,
    #[serde(default)]
    pub use_multiple_mongoses: Option<bool>,
    #[serde(default)]
    pub observe_events: Vec<String>,
    #[serde(default)]
    pub ignore_command_monitoring_events: Vec<String>,
    #[serde(default)]
    pub observe_sensitive_commands: bool,
    #[serde(default)]
    pub server_api: Option<ServerApi>,
    #[serde(default)]
    pub store_events_as_entities: Vec<StoredEventList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UriOptions {
    pub appname: Option<String>,
    pub load_balanced: Option<bool>,
    pub max_pool_size: Option<u32>,
    pub retry_reads: Option<bool>,
    pub retry_writes: Option<bool>,
    pub read_concern_level: Option<String>,
    pub w: Option<Value>,
    #[serde(rename = "waitQueueTimeoutMS")]
    pub wait_queue_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerApi {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_errors: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoredEventList {
    pub id: String,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatabaseDescriptor {
    pub id: String,
    pub client: String,
    pub database_name: String,
    #[serde(default)]
    pub database_options: Option<ConcernOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConcernOptions {
    pub read_concern: Option<Document>,
    pub read_preference: Option<Document>,
    pub write_concern: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollectionDescriptor {
    pub id: String,
    pub database: String,
    pub collection_name: String,
    #[serde(default)]
    pub collection_options: Option<ConcernOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionDescriptor {
    pub id: String,
    pub client: String,
    #[serde(default)]
    pub session_options: Option<SessionOptionsDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionOptionsDescriptor {
    pub causal_consistency: Option<bool>,
    pub snapshot: Option<bool>,
    pub default_transaction_options: Option<TransactionOptionsDescriptor>,
}

/// Transaction options as written in scenario files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransactionOptionsDescriptor {
    pub read_concern: Option<Document>,
    pub read_preference: Option<Document>,
    pub write_concern: Option<Document>,
    #[serde(rename = "maxCommitTimeMS")]
    pub max_commit_time_ms: Option<u64>,
}

impl From<TransactionOptionsDescriptor> for TransactionOptions {
    fn from(d: TransactionOptionsDescriptor) -> Self {
        TransactionOptions {
            read_concern: d.read_concern,
            read_preference: d.read_preference,
            write_concern: d.write_concern,
            max_commit_time_ms: d.max_commit_time_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketDescriptor {
    pub id: String,
    pub database: String,
    #[serde(default)]
    pub bucket_options: Option<BucketOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketOptions {
    pub bucket_name: Option<String>,
    pub chunk_size_bytes: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientEncryptionDescriptor {
    pub id: String,
    pub client_encryption_opts: ClientEncryptionOpts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientEncryptionOpts {
    pub key_vault_client: String,
    pub key_vault_namespace: String,
    pub kms_providers: Document,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadDescriptor {
    pub id: String,
}

/// Parse a `createEntities` array.
pub fn parse_descriptors(values: &[Value]) -> Result<Vec<EntityDescriptor>> {
    values
        .iter()
        .map(|value| {
            serde_json::from_value(value.clone()).map_err(|err| {
                RunnerError::format(format!("Invalid entity descriptor {}: {}", value, err))
            })
        })
        .collect()
}

// ============================================================================
// Builder
// ============================================================================

pub struct EntityMapBuilder<'a> {
    deployment: Arc<Deployment>,
    config: &'a RunnerConfig,
    parent: Option<&'a EntityMap>,
}

impl<'a> EntityMapBuilder<'a> {
    pub fn new(deployment: Arc<Deployment>, config: &'a RunnerConfig) -> Self {
        Self {
            deployment,
            config,
            parent: None,
        }
    }

    /// Resolve references that are not in the new map against `parent`.
    pub fn parent(mut self, parent: &'a EntityMap) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(&self, descriptors: &[EntityDescriptor]) -> Result<EntityMap> {
        let map = EntityMap::new(self.deployment.clone());
        for descriptor in descriptors {
            if self.parent.map(|p| p.contains(descriptor.id())).transpose()?.unwrap_or(false) {
                return Err(RunnerError::EntityExists(descriptor.id().to_string()));
            }
            self.build_one(&map, descriptor)?;
            debug!(entity = descriptor.id(), "Created entity");
        }
        Ok(map)
    }

    fn lookup<T>(&self, map: &EntityMap, get: impl Fn(&EntityMap) -> Result<T>) -> Result<T> {
        match (get(map), self.parent) {
            (Err(RunnerError::EntityNotFound { .. }), Some(parent)) => get(parent),
            (result, _) => result,
        }
    }

    fn build_one(&self, map: &EntityMap, descriptor: &EntityDescriptor) -> Result<()> {
        match descriptor {
            EntityDescriptor::Client(d) => self.build_client(map, d),
            EntityDescriptor::Database(d) => {
                let client = self.lookup(map, |m| m.client(&d.client))?;
                let options = d.database_options.clone().unwrap_or_default();
                let database = client
                    .database(&d.database_name)
                    .with_concerns(options.read_concern, options.write_concern);
                map.insert_database(&d.id, database)
            }
            EntityDescriptor::Collection(d) => {
                let database = self.lookup(map, |m| m.database(&d.database))?;
                let options = d.collection_options.clone().unwrap_or_default();
                let collection = database
                    .collection(&d.collection_name)
                    .with_concerns(options.read_concern, options.write_concern);
                map.insert_collection(&d.id, collection)
            }
            EntityDescriptor::Session(d) => {
                let client = self.lookup(map, |m| m.client(&d.client))?;
                let options = d.session_options.clone().unwrap_or_default();
                let session = client.start_session(SessionOptions {
                    causal_consistency: options.causal_consistency,
                    snapshot: options.snapshot,
                    default_transaction_options: options
                        .default_transaction_options
                        .map(TransactionOptions::from)
                        .unwrap_or_default(),
                })?;
                map.insert_session(&d.id, session)
            }
            EntityDescriptor::Bucket(d) => {
                let database = self.lookup(map, |m| m.database(&d.database))?;
                let mut options = GridFsOptions::default();
                if let Some(bucket_options) = &d.bucket_options {
                    if let Some(name) = &bucket_options.bucket_name {
                        options = options.bucket_name(name);
                    }
                    if let Some(size) = bucket_options.chunk_size_bytes {
                        options = options.chunk_size_bytes(size);
                    }
                }
                map.insert_bucket(&d.id, GridFsBucket::new(database, options))
            }
            EntityDescriptor::ClientEncryption(d) => {
                let opts = &d.client_encryption_opts;
                let key_vault_client = self.lookup(map, |m| m.client(&opts.key_vault_client))?;
                let encryption = ClientEncryption::new(ClientEncryptionOptions {
                    key_vault_client,
                    key_vault_namespace: opts.key_vault_namespace.clone(),
                    kms_providers: opts.kms_providers.clone(),
                })?;
                map.insert_client_encryption(&d.id, encryption)
            }
            EntityDescriptor::Thread(d) => {
                map.insert_thread(&d.id, Arc::new(ThreadEntity::new(&d.id)))
            }
        }
    }

    fn build_client(&self, map: &EntityMap, d: &ClientDescriptor) -> Result<()> {
        let uri = &d.uri_options;
        let mut options = ClientOptions::default();
        if let Some(app_name) = &uri.appname {
            options = options.app_name(app_name);
        }
        if let Some(retry) = uri.retry_reads {
            options = options.retry_reads(retry);
        }
        if let Some(retry) = uri.retry_writes {
            options = options.retry_writes(retry);
        }
        if let Some(size) = uri.max_pool_size {
            options = options.max_pool_size(size);
        }
        if let Some(load_balanced) = uri.load_balanced {
            options = options.load_balanced(load_balanced);
        }
        if let Some(level) = &uri.read_concern_level {
            let mut read_concern = Document::new();
            read_concern.insert("level".to_string(), Value::String(level.clone()));
            options = options.read_concern(read_concern);
        }
        if let Some(w) = &uri.w {
            let mut write_concern = Document::new();
            write_concern.insert("w".to_string(), w.clone());
            options = options.write_concern(write_concern);
        }
        if let Some(server_api) = &d.server_api {
            let value = serde_json::to_value(server_api)
                .map_err(|err| RunnerError::format(format!("Invalid serverApi: {}", err)))?;
            options = options.server_api(into_document(value).unwrap_or_default());
        }

        let mut capturer = None;
        if !d.observe_events.is_empty() {
            let filter = CaptureFilter::new(d.observe_events.iter().cloned())
                .ignore_commands(self.config.ignored_commands.iter().cloned())
                .ignore_commands(d.ignore_command_monitoring_events.iter().cloned())
                .observe_sensitive(d.observe_sensitive_commands);
            let observed = Arc::new(EventCapturer::new(filter));
            options = options.listener(observed.clone());
            capturer = Some(observed);
        }
        let mut stored = Vec::new();
        for list in &d.store_events_as_entities {
            let filter = CaptureFilter::new(list.events.iter().cloned());
            let list_capturer = Arc::new(EventCapturer::new(filter));
            options = options.listener(list_capturer.clone());
            stored.push((list.id.clone(), list_capturer));
        }

        map.insert_client(&d.id, Client::new(self.deployment.clone(), options))?;
        if let Some(capturer) = capturer {
            map.attach_capturer(&d.id, capturer)?;
        }
        for (id, list_capturer) in stored {
            map.insert_event_list(&id, list_capturer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServerInfo;
    use serde_json::json;

    fn descriptors(value: Value) -> Vec<EntityDescriptor> {
        parse_descriptors(value.as_array().unwrap()).unwrap()
    }

    #[test]
    fn test_builds_in_order() {
        let config = RunnerConfig::default();
        let builder = EntityMapBuilder::new(Deployment::new(ServerInfo::default()), &config);
        let map = builder
            .build(&descriptors(json!([
                {"client": {"id": "client0", "observeEvents": ["commandStartedEvent"]}},
                {"database": {"id": "db0", "client": "client0", "databaseName": "db"}},
                {"collection": {"id": "coll0", "database": "db0", "collectionName": "coll"}},
                {"session": {"id": "session0", "client": "client0"}},
                {"bucket": {"id": "bucket0", "database": "db0"}},
                {"thread": {"id": "thread0"}}
            ])))
            .unwrap();
        assert_eq!(map.collection("coll0").unwrap().name(), "coll");
        assert!(map.session_lsid("session0").is_ok());
        assert!(map.capturer("client0").is_ok());
        assert!(map.thread("thread0").is_ok());
    }

    #[test]
    fn test_forward_reference_fails_fast() {
        let config = RunnerConfig::default();
        let builder = EntityMapBuilder::new(Deployment::new(ServerInfo::default()), &config);
        let result = builder.build(&descriptors(json!([
            {"database": {"id": "db0", "client": "client0", "databaseName": "db"}},
            {"client": {"id": "client0"}}
        ])));
        assert!(matches!(result, Err(RunnerError::EntityNotFound { kind: "client", .. })));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let values = json!([{"client": {"id": "client0", "bogus": true}}]);
        assert!(matches!(
            parse_descriptors(values.as_array().unwrap()),
            Err(RunnerError::Format(_))
        ));
        let values = json!([{"widget": {"id": "w"}}]);
        assert!(parse_descriptors(values.as_array().unwrap()).is_err());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let config = RunnerConfig::default();
        let builder = EntityMapBuilder::new(Deployment::new(ServerInfo::default()), &config);
        let result = builder.build(&descriptors(json!([
            {"client": {"id": "x"}},
            {"thread": {"id": "x"}}
        ])));
        assert!(matches!(result, Err(RunnerError::EntityExists(_))));
    }
}
