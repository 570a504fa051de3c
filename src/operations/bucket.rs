use super::arguments::Arguments;
use super::collection::find_options;
use super::result::{IntoOperationResult, OperationResult};
use super::{EntityOperation, Operation, OperationContext};
use crate::core::{Document, Result, RunnerError};
use crate::service::gridfs::binary_value;
use crate::service::{FindOptions, GridFsBucket, ServiceResult, UploadOptions};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Latest revision of a file.
const LATEST_REVISION: i64 = -1;

enum Call {
    Upload { filename: String, source: Vec<u8>, options: UploadOptions },
    Download { id: Value },
    DownloadByName { filename: String, revision: i64 },
    Delete { id: Value },
    Rename { id: Value, new_filename: String },
    Find { filter: Document, options: FindOptions },
    Drop,
}

pub struct BucketOperation {
    bucket: GridFsBucket,
    call: Call,
}

/// Decode `{"$$hexBytes": "..."}`.
fn hex_source(value: Value) -> Result<Vec<u8>> {
    let text = value
        .get("$$hexBytes")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RunnerError::format("upload source must be {\"$$hexBytes\": <hex string>}")
        })?;
    hex::decode(text)
        .map_err(|err| RunnerError::format(format!("Invalid hex bytes '{}': {}", text, err)))
}

pub fn create(
    name: &str,
    target: &str,
    arguments: Document,
    ctx: &OperationContext,
) -> Result<Operation> {
    let bucket = ctx.entities.bucket(target)?;
    let allowed: &[&str] = match name {
        "upload" => &["filename", "source", "chunkSizeBytes", "metadata"],
        "download" | "delete" => &["id"],
        "downloadByName" => &["filename", "revision"],
        "rename" => &["id", "newFilename"],
        "find" => &["filter", "sort", "skip", "limit", "batchSize"],
        "drop" => &[],
        other => {
            return Err(RunnerError::format(format!("Unsupported bucket operation '{}'", other)));
        }
    };
    let args = Arguments::new(name, arguments, allowed)?;
    let call = match name {
        "upload" => Call::Upload {
            filename: args.required_string("filename")?,
            source: hex_source(args.required_value("source")?)?,
            options: UploadOptions {
                chunk_size_bytes: args
                    .u64("chunkSizeBytes")?
                    .map(|size| {
                        u32::try_from(size)
                            .map_err(|_| RunnerError::format("chunkSizeBytes is too large"))
                    })
                    .transpose()?,
                metadata: args.document("metadata")?,
            },
        },
        "download" => Call::Download {
            id: args.required_value("id")?,
        },
        "downloadByName" => Call::DownloadByName {
            filename: args.required_string("filename")?,
            revision: args.i64("revision")?.unwrap_or(LATEST_REVISION),
        },
        "delete" => Call::Delete {
            id: args.required_value("id")?,
        },
        "rename" => Call::Rename {
            id: args.required_value("id")?,
            new_filename: args.required_string("newFilename")?,
        },
        "find" => Call::Find {
            filter: args.required_document("filter")?,
            options: find_options(&args)?,
        },
        _ => Call::Drop,
    };
    Ok(Operation::Entity(Box::new(BucketOperation { bucket, call })))
}

fn bytes(result: ServiceResult<Vec<u8>>) -> OperationResult {
    result.into_result(|bytes| OperationResult::Value(binary_value(&bytes, "00")))
}

#[async_trait]
impl EntityOperation for BucketOperation {
    fn execute(&self, cancel: &CancellationToken) -> OperationResult {
        let bucket = &self.bucket;
        match &self.call {
            Call::Upload {
                filename,
                source,
                options,
            } => bucket
                .upload(filename, source, options.clone(), cancel)
                .into_result(OperationResult::Value),
            Call::Download { id } => bytes(
                bucket
                    .open_download_stream(id, cancel)
                    .and_then(|stream| stream.read_to_end(cancel)),
            ),
            Call::DownloadByName { filename, revision } => {
                bytes(bucket.download_by_name(filename, *revision, cancel))
            }
            Call::Delete { id } => bucket.delete(id, cancel).into_empty(),
            Call::Rename { id, new_filename } => {
                bucket.rename(id, new_filename, cancel).into_empty()
            }
            Call::Find { filter, options } => bucket
                .files()
                .find(filter, options.clone(), None, cancel)
                .and_then(|cursor| cursor.collect_all(cancel))
                .into_result(OperationResult::documents),
            Call::Drop => bucket.drop(cancel).into_empty(),
        }
    }

    async fn execute_async(&self, cancel: &CancellationToken) -> OperationResult {
        let bucket = &self.bucket;
        match &self.call {
            Call::Upload {
                filename,
                source,
                options,
            } => bucket
                .upload_async(filename, source, options.clone(), cancel)
                .await
                .into_result(OperationResult::Value),
            Call::Download { id } => match bucket.open_download_stream_async(id, cancel).await {
                Ok(stream) => bytes(stream.read_to_end_async(cancel).await),
                Err(err) => OperationResult::Error(err),
            },
            Call::DownloadByName { filename, revision } => {
                bytes(bucket.download_by_name_async(filename, *revision, cancel).await)
            }
            Call::Delete { id } => bucket.delete_async(id, cancel).await.into_empty(),
            Call::Rename { id, new_filename } => {
                bucket.rename_async(id, new_filename, cancel).await.into_empty()
            }
            Call::Find { filter, options } => match bucket
                .files()
                .find_async(filter, options.clone(), None, cancel)
                .await
            {
                Ok(cursor) => cursor
                    .collect_all_async(cancel)
                    .await
                    .into_result(OperationResult::documents),
                Err(err) => OperationResult::Error(err),
            },
            Call::Drop => bucket.drop_async(cancel).await.into_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hex_source() {
        assert_eq!(hex_source(json!({"$$hexBytes": "0a0b"})).unwrap(), vec![10, 11]);
        assert!(hex_source(json!({"$$hexBytes": "zz"})).is_err());
        assert!(hex_source(json!("0a0b")).is_err());
    }
}
