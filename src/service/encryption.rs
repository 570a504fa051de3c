// ============================================================================
// Key Vault Management
// ============================================================================
//
// Data keys live in the key-vault namespace as
//   {_id: UUID, keyAltNames?, keyMaterial, creationDate, updateDate, status, masterKey}
// Only key management is modelled; payloads are never encrypted.
//
// ============================================================================

use super::client::Client;
use super::collection::{
    Collection, DeleteOptions, FindOneAndModifyOptions, FindOptions, InsertOneOptions,
    ReturnDocument, UpdateOptions, WriteModel,
};
use super::cursor::Cursor;
use super::error::{ServiceError, ServiceResult};
use super::gridfs::binary_value;
use super::results::{BulkWriteResult, DeleteResult};
use super::store::Namespace;
use crate::core::document::{Document, DocumentExt};
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const KEY_MATERIAL_LEN: usize = 96;

/// Fields each KMS provider requires in a master key.
fn required_master_key_fields(provider: &str) -> ServiceResult<&'static [&'static str]> {
    let kind = provider.split_once(':').map_or(provider, |(kind, _)| kind);
    Ok(match kind {
        "local" | "kmip" => &[],
        "aws" => &["region", "key"],
        "azure" => &["keyVaultEndpoint", "keyName"],
        "gcp" => &["projectId", "location", "keyRing", "keyName"],
        other => {
            return Err(ServiceError::invalid_argument(format!(
                "Unsupported KMS provider '{}'",
                other
            )));
        }
    })
}

#[derive(Clone)]
pub struct ClientEncryptionOptions {
    pub key_vault_client: Client,
    pub key_vault_namespace: String,
    pub kms_providers: Document,
}

#[derive(Debug, Clone, Default)]
pub struct DataKeyOptions {
    pub master_key: Option<Document>,
    pub key_alt_names: Vec<String>,
    pub key_material: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct RewrapManyDataKeyOptions {
    pub provider: Option<String>,
    pub master_key: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewrapManyDataKeyResult {
    pub bulk_write_result: Option<BulkWriteResult>,
}

#[derive(Clone)]
pub struct ClientEncryption {
    key_vault: Collection,
    kms_providers: Document,
}

fn now() -> Value {
    json!({"$date": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)})
}

fn uuid_value() -> Value {
    binary_value(uuid::Uuid::new_v4().as_bytes(), "04")
}

fn random_key_material() -> Vec<u8> {
    let mut material = Vec::with_capacity(KEY_MATERIAL_LEN);
    while material.len() < KEY_MATERIAL_LEN {
        material.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    material.truncate(KEY_MATERIAL_LEN);
    material
}

fn by_id(id: &Value) -> Document {
    let mut filter = Document::new();
    filter.insert("_id".to_string(), id.clone());
    filter
}

impl ClientEncryption {
    pub fn new(options: ClientEncryptionOptions) -> ServiceResult<Self> {
        let namespace = Namespace::parse(&options.key_vault_namespace)?;
        if options.kms_providers.is_empty() {
            return Err(ServiceError::invalid_argument(
                "At least one KMS provider must be configured",
            ));
        }
        for provider in options.kms_providers.keys() {
            required_master_key_fields(provider)?;
        }
        let majority = json!({"w": "majority"}).as_object().cloned();
        let key_vault = options
            .key_vault_client
            .database(&namespace.db)
            .collection(&namespace.coll)
            .with_concerns(None, majority);
        Ok(Self {
            key_vault,
            kms_providers: options.kms_providers,
        })
    }

    pub fn key_vault(&self) -> &Collection {
        &self.key_vault
    }

    fn master_key(&self, provider: &str, master_key: Option<Document>) -> ServiceResult<Document> {
        if !self.kms_providers.contains_key(provider) {
            return Err(ServiceError::invalid_argument(format!(
                "KMS provider '{}' is not configured",
                provider
            )));
        }
        let master_key = master_key.unwrap_or_default();
        for field in required_master_key_fields(provider)? {
            if !master_key.contains_key(*field) {
                return Err(ServiceError::invalid_argument(format!(
                    "Master key for provider '{}' requires '{}'",
                    provider, field
                )));
            }
        }
        let mut stored = Document::new();
        stored.insert("provider".to_string(), Value::String(provider.to_string()));
        stored.extend(master_key);
        Ok(stored)
    }

    /// Create and store a new data key; returns its UUID.
    pub fn create_data_key(
        &self,
        provider: &str,
        options: DataKeyOptions,
        cancel: &CancellationToken,
    ) -> ServiceResult<Value> {
        let master_key = self.master_key(provider, options.master_key)?;
        let material = match options.key_material {
            Some(material) if material.len() != KEY_MATERIAL_LEN => {
                return Err(ServiceError::invalid_argument(format!(
                    "keyMaterial must be {} bytes",
                    KEY_MATERIAL_LEN
                )));
            }
            Some(material) => material,
            None => random_key_material(),
        };

        let id = uuid_value();
        let mut key = Document::new();
        key.insert("_id".to_string(), id.clone());
        if !options.key_alt_names.is_empty() {
            key.insert("keyAltNames".to_string(), json!(options.key_alt_names));
        }
        key.insert("keyMaterial".to_string(), binary_value(&material, "00"));
        key.insert("creationDate".to_string(), now());
        key.insert("updateDate".to_string(), now());
        key.insert("status".to_string(), Value::from(0));
        key.insert("masterKey".to_string(), Value::Object(master_key));
        self.key_vault.insert_one(key, InsertOneOptions::default(), None, cancel)?;
        debug!(provider, "Created data key");
        Ok(id)
    }

    pub fn get_key(
        &self,
        id: &Value,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        self.key_vault.find_one(&by_id(id), FindOptions::default(), None, cancel)
    }

    pub fn get_keys(&self, cancel: &CancellationToken) -> ServiceResult<Cursor> {
        self.key_vault.find(&Document::new(), FindOptions::default(), None, cancel)
    }

    pub fn delete_key(
        &self,
        id: &Value,
        cancel: &CancellationToken,
    ) -> ServiceResult<DeleteResult> {
        self.key_vault.delete_one(&by_id(id), DeleteOptions::default(), None, cancel)
    }

    /// Add an alternate name; returns the key as it was before the change.
    pub fn add_key_alt_name(
        &self,
        id: &Value,
        name: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        self.key_vault.find_one_and_update(
            &by_id(id),
            json!({"$addToSet": {"keyAltNames": name}}),
            FindOneAndModifyOptions::default(),
            None,
            cancel,
        )
    }

    /// Remove an alternate name, dropping the field once no names remain.
    /// Returns the key as it was before the change.
    pub fn remove_key_alt_name(
        &self,
        id: &Value,
        name: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let before = self.key_vault.find_one_and_update(
            &by_id(id),
            json!({"$pull": {"keyAltNames": name}}),
            FindOneAndModifyOptions {
                return_document: ReturnDocument::Before,
                ..FindOneAndModifyOptions::default()
            },
            None,
            cancel,
        )?;
        let emptied = before
            .as_ref()
            .and_then(|key| key.get_array("keyAltNames"))
            .is_some_and(|names| names.iter().all(|n| n.as_str() == Some(name)));
        if emptied {
            self.key_vault.update_one(
                &by_id(id),
                json!({"$unset": {"keyAltNames": ""}}),
                UpdateOptions::default(),
                None,
                cancel,
            )?;
        }
        Ok(before)
    }

    pub fn get_key_by_alt_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Document>> {
        let mut filter = Document::new();
        filter.insert("keyAltNames".to_string(), Value::String(name.to_string()));
        self.key_vault.find_one(&filter, FindOptions::default(), None, cancel)
    }

    /// Re-wrap every matching key, optionally under a new master key.
    pub fn rewrap_many_data_key(
        &self,
        filter: &Document,
        options: RewrapManyDataKeyOptions,
        cancel: &CancellationToken,
    ) -> ServiceResult<RewrapManyDataKeyResult> {
        if options.master_key.is_some() && options.provider.is_none() {
            return Err(ServiceError::invalid_argument(
                "A provider is required when a master key is given",
            ));
        }
        let replacement_key = match &options.provider {
            Some(provider) => Some(self.master_key(provider, options.master_key.clone())?),
            None => None,
        };

        let keys = self
            .key_vault
            .find(filter, FindOptions::default(), None, cancel)?
            .collect_all(cancel)?;
        if keys.is_empty() {
            return Ok(RewrapManyDataKeyResult::default());
        }

        let mut models = Vec::with_capacity(keys.len());
        for key in keys {
            let master_key = match &replacement_key {
                Some(master_key) => Value::Object(master_key.clone()),
                None => key.get("masterKey").cloned().unwrap_or(Value::Null),
            };
            let id = key.get("_id").cloned().unwrap_or(Value::Null);
            models.push(WriteModel::UpdateOne {
                filter: by_id(&id),
                update: json!({"$set": {
                    "masterKey": master_key,
                    "keyMaterial": binary_value(&random_key_material(), "00"),
                    "updateDate": now()
                }}),
                upsert: false,
            });
        }
        let result = self.key_vault.bulk_write(models, Default::default(), None, cancel)?;
        Ok(RewrapManyDataKeyResult {
            bulk_write_result: Some(result),
        })
    }

    async_pair!(create_data_key_async => create_data_key(
        provider: &str,
        options: DataKeyOptions
    ) -> ServiceResult<Value>);
    async_pair!(get_key_async => get_key(id: &Value) -> ServiceResult<Option<Document>>);
    async_pair!(get_keys_async => get_keys() -> ServiceResult<Cursor>);
    async_pair!(delete_key_async => delete_key(id: &Value) -> ServiceResult<DeleteResult>);
    async_pair!(add_key_alt_name_async => add_key_alt_name(
        id: &Value,
        name: &str
    ) -> ServiceResult<Option<Document>>);
    async_pair!(remove_key_alt_name_async => remove_key_alt_name(
        id: &Value,
        name: &str
    ) -> ServiceResult<Option<Document>>);
    async_pair!(get_key_by_alt_name_async => get_key_by_alt_name(
        name: &str
    ) -> ServiceResult<Option<Document>>);
    async_pair!(rewrap_many_data_key_async => rewrap_many_data_key(
        filter: &Document,
        options: RewrapManyDataKeyOptions
    ) -> ServiceResult<RewrapManyDataKeyResult>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::client::ClientOptions;
    use crate::service::deployment::{Deployment, ServerInfo};

    fn encryption() -> (ClientEncryption, CancellationToken) {
        let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
        let options = ClientEncryptionOptions {
            key_vault_client: client,
            key_vault_namespace: "keyvault.datakeys".to_string(),
            kms_providers: json!({"local": {"key": "AAAA"}, "aws": {}}).as_object().cloned().unwrap(),
        };
        (ClientEncryption::new(options).unwrap(), CancellationToken::new())
    }

    #[test]
    fn test_create_and_lookup_by_alt_name() {
        let (encryption, cancel) = encryption();
        let options = DataKeyOptions {
            key_alt_names: vec!["alpha".to_string()],
            ..DataKeyOptions::default()
        };
        let id = encryption.create_data_key("local", options, &cancel).unwrap();
        let key = encryption.get_key_by_alt_name("alpha", &cancel).unwrap().unwrap();
        assert_eq!(key["_id"], id);
        assert_eq!(key["masterKey"], json!({"provider": "local"}));
    }

    #[test]
    fn test_provider_validation() {
        let (encryption, cancel) = encryption();
        assert!(encryption.create_data_key("gcp", DataKeyOptions::default(), &cancel).is_err());
        let err = encryption
            .create_data_key("aws", DataKeyOptions::default(), &cancel)
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_remove_last_alt_name_unsets_field() {
        let (encryption, cancel) = encryption();
        let id = encryption.create_data_key("local", DataKeyOptions::default(), &cancel).unwrap();
        encryption.add_key_alt_name(&id, "a", &cancel).unwrap();
        let before = encryption.remove_key_alt_name(&id, "a", &cancel).unwrap().unwrap();
        assert_eq!(before["keyAltNames"], json!(["a"]));
        let key = encryption.get_key(&id, &cancel).unwrap().unwrap();
        assert!(!key.contains_key("keyAltNames"));
    }

    #[test]
    fn test_rewrap_reports_bulk_result() {
        let (encryption, cancel) = encryption();
        encryption.create_data_key("local", DataKeyOptions::default(), &cancel).unwrap();
        encryption.create_data_key("local", DataKeyOptions::default(), &cancel).unwrap();
        let result = encryption
            .rewrap_many_data_key(&Document::new(), RewrapManyDataKeyOptions::default(), &cancel)
            .unwrap();
        assert_eq!(result.bulk_write_result.unwrap().modified_count, 2);

        let none = encryption
            .rewrap_many_data_key(&json!({"status": 5}).as_object().cloned().unwrap(), Default::default(), &cancel)
            .unwrap();
        assert!(none.bulk_write_result.is_none());
    }
}
