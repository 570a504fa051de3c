use super::arguments::Arguments;
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::service::gridfs::binary_bytes;
use crate::service::results::to_document;
use crate::service::{
    ClientEncryption, DataKeyOptions, DeleteResult, RewrapManyDataKeyOptions,
    RewrapManyDataKeyResult,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

enum Call {
    CreateDataKey { provider: String, options: DataKeyOptions },
    GetKey { id: Value },
    GetKeys,
    DeleteKey { id: Value },
    AddKeyAltName { id: Value, name: String },
    RemoveKeyAltName { id: Value, name: String },
    GetKeyByAltName { name: String },
    RewrapManyDataKey { filter: Document, options: RewrapManyDataKeyOptions },
}

/// Key vault management through a client encryption entity.
pub struct EncryptionOperation {
    encryption: ClientEncryption,
    call: Call,
}

fn data_key_options(args: &Arguments) -> Result<DataKeyOptions> {
    let Some(opts) = args.document("opts")? else {
        return Ok(DataKeyOptions::default());
    };
    let opts = Arguments::new(
        "createDataKey opts",
        opts,
        &["masterKey", "keyAltNames", "keyMaterial"],
    )?;
    let key_alt_names = match opts.value("keyAltNames") {
        None => Vec::new(),
        Some(Value::Array(names)) => names
            .iter()
            .map(|name| {
                name.as_str()
                    .map(String::from)
                    .ok_or_else(|| RunnerError::format("keyAltNames must be strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(RunnerError::format("keyAltNames must be an array")),
    };
    let key_material = match opts.value("keyMaterial") {
        None => None,
        Some(value) => Some(
            binary_bytes(&value)
                .ok_or_else(|| RunnerError::format("keyMaterial must be binary data"))?,
        ),
    };
    Ok(DataKeyOptions {
        master_key: opts.document("masterKey")?,
        key_alt_names,
        key_material,
    })
}

fn rewrap_options(args: &Arguments) -> Result<RewrapManyDataKeyOptions> {
    let Some(opts) = args.document("opts")? else {
        return Ok(RewrapManyDataKeyOptions::default());
    };
    let opts = Arguments::new("rewrapManyDataKey opts", opts, &["provider", "masterKey"])?;
    Ok(RewrapManyDataKeyOptions {
        provider: opts.string("provider")?,
        master_key: opts.document("masterKey")?,
    })
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let encryption = ctx.entities.client_encryption(target)?;
    let allowed: &[&str] = match name {
        "createDataKey" => &["kmsProvider", "opts"],
        "getKey" | "deleteKey" => &["id"],
        "getKeys" => &[],
        "addKeyAltName" | "removeKeyAltName" => &["id", "keyAltName"],
        "getKeyByAltName" => &["keyAltName"],
        "rewrapManyDataKey" => &["filter", "opts"],
        other => {
            return Err(RunnerError::format(format!(
                "Unsupported clientEncryption operation '{}'",
                other
            )));
        }
    };
    let args = Arguments::new(name, arguments, allowed)?;
    let call = match name {
        "createDataKey" => Call::CreateDataKey {
            provider: args.required_string("kmsProvider")?,
            options: data_key_options(&args)?,
        },
        "getKey" => Call::GetKey {
            id: args.required_value("id")?,
        },
        "getKeys" => Call::GetKeys,
        "deleteKey" => Call::DeleteKey {
            id: args.required_value("id")?,
        },
        "addKeyAltName" => Call::AddKeyAltName {
            id: args.required_value("id")?,
            name: args.required_string("keyAltName")?,
        },
        "removeKeyAltName" => Call::RemoveKeyAltName {
            id: args.required_value("id")?,
            name: args.required_string("keyAltName")?,
        },
        "getKeyByAltName" => Call::GetKeyByAltName {
            name: args.required_string("keyAltName")?,
        },
        _ => Call::RewrapManyDataKey {
            filter: args.required_document("filter")?,
            options: rewrap_options(&args)?,
        },
    };
    Ok(Operation::Entity(Box::new(EncryptionOperation { encryption, call })))
}

fn deleted(result: DeleteResult) -> OperationResult {
    OperationResult::serialized(&result)
}

fn rewrapped(result: RewrapManyDataKeyResult) -> OperationResult {
    let mut doc = Document::new();
    if let Some(bulk) = result.bulk_write_result {
        doc.insert("bulkWriteResult".to_string(), Value::Object(to_document(&bulk)));
    }
    OperationResult::document(doc)
}

#[async_trait]
impl EntityOperation for EncryptionOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        let enc = &self.encryption;
        match &self.call {
            Call::CreateDataKey { provider, options } => enc
                .create_data_key(provider, options.clone(), cancel)
                .into_result(OperationResult::Value),
            Call::GetKey { id } => enc
                .get_key(id, cancel)
                .into_result(OperationResult::optional_document),
            Call::GetKeys => enc
                .get_keys(cancel)
                .and_then(|cursor| cursor.collect_all(cancel))
                .into_result(OperationResult::documents),
            Call::DeleteKey { id } => enc.delete_key(id, cancel).into_result(deleted),
            Call::AddKeyAltName { id, name } => enc
                .add_key_alt_name(id, name, cancel)
                .into_result(OperationResult::optional_document),
            Call::RemoveKeyAltName { id, name } => enc
                .remove_key_alt_name(id, name, cancel)
                .into_result(OperationResult::optional_document),
            Call::GetKeyByAltName { name } => enc
                .get_key_by_alt_name(name, cancel)
                .into_result(OperationResult::optional_document),
            Call::RewrapManyDataKey { filter, options } => enc
                .rewrap_many_data_key(filter, options.clone(), cancel)
                .into_result(rewrapped),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        let enc = &self.encryption;
        match &self.call {
            Call::CreateDataKey { provider, options } => enc
                .create_data_key_async(provider, options.clone(), cancel)
                .await
                .into_result(OperationResult::Value),
            Call::GetKey { id } => enc
                .get_key_async(id, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::GetKeys => match enc.get_keys_async(cancel).await {
                Ok(cursor) => cursor
                    .collect_all_async(cancel)
                    .await
                    .into_result(OperationResult::documents),
                Err(err) => OperationResult::Error(err),
            },
            Call::DeleteKey { id } => enc.delete_key_async(id, cancel).await.into_result(deleted),
            Call::AddKeyAltName { id, name } => enc
                .add_key_alt_name_async(id, name, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::RemoveKeyAltName { id, name } => enc
                .remove_key_alt_name_async(id, name, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::GetKeyByAltName { name } => enc
                .get_key_by_alt_name_async(name, cancel)
                .await
                .into_result(OperationResult::optional_document),
            Call::RewrapManyDataKey { filter, options } => enc
                .rewrap_many_data_key_async(filter, options.clone(), cancel)
                .await
                .into_result(rewrapped),
        }
    }
}
