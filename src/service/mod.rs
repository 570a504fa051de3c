//! In-memory document deployment consumed by the scenario runner.
//!
//! Every blocking call has an `_async` twin; the async twin yields to the
//! scheduler, honours cancellation and then performs the same work, so both
//! paths produce identical results and events.

use tokio_util::sync::CancellationToken;

/// Generate the async twin of a synchronous service method.
macro_rules! async_pair {
    (
        $(#[$meta:meta])*
        $async_name:ident => $sync_name:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty
    ) => {
        $(#[$meta])*
        pub async fn $async_name(
            &self,
            $($arg: $ty,)*
            cancel: &tokio_util::sync::CancellationToken,
        ) -> $ret {
            crate::service::yield_checked(cancel).await?;
            self.$sync_name($($arg,)* cancel)
        }
    };
}

pub mod change_stream;
pub mod client;
pub mod collection;
pub mod cursor;
pub mod database;
pub mod deployment;
pub mod encryption;
pub mod error;
pub mod events;
pub mod gridfs;
pub mod query;
pub mod results;
pub mod session;
pub mod store;

pub use change_stream::{ChangeStream, ChangeStreamOptions};
pub use client::{Client, ClientOptions};
pub use collection::{
    AggregateOptions, BulkWriteOptions, Collection, CountOptions, DeleteOptions,
    FindOneAndModifyOptions, FindOptions, IndexOptions, InsertManyOptions, InsertOneOptions,
    ReturnDocument, UpdateOptions, WriteModel,
};
pub use cursor::Cursor;
pub use database::Database;
pub use deployment::{Deployment, ServerInfo, Topology};
pub use encryption::{
    ClientEncryption, ClientEncryptionOptions, DataKeyOptions, RewrapManyDataKeyOptions,
    RewrapManyDataKeyResult,
};
pub use error::{ErrorKind, HasErrorLabels, ServiceError, ServiceResult};
pub use events::{EventCategory, EventListener, ServiceEvent};
pub use gridfs::{GridFsBucket, GridFsDownloadStream, GridFsOptions, UploadOptions};
pub use session::{ClientSession, SessionOptions, TransactionOptions, TransactionState};
pub use results::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
pub use store::Namespace;

pub(crate) async fn yield_checked(cancel: &CancellationToken) -> ServiceResult<()> {
    tokio::task::yield_now().await;
    if cancel.is_cancelled() {
        return Err(ServiceError::cancelled());
    }
    Ok(())
}
