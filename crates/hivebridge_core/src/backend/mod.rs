//! Backing collaborator contracts.
//!
//! # Responsibility
//! - Describe the asynchronous remote service the bridge wraps.
//! - Keep storage, authentication and payment semantics outside the bridge.
//!
//! # Invariants
//! - Every fallible operation reports failures as `BackendError`.
//! - Streams are blocking `Read`/`Write` objects; callers must run them on
//!   blocking workers.

pub mod local;
mod types;

pub use types::{
    ClientOptions, DeleteResult, FileInfo, FileKind, FindOptions, InsertManyResult,
    InsertOneResult, UpdateResult,
};

use crate::error::BackendResult;
use async_trait::async_trait;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Sequential byte source produced by download-like operations.
pub type ReadStream = Box<dyn Read + Send>;
/// Sequential byte sink produced by upload-like operations.
pub type WriteStream = Box<dyn Write + Send>;

/// Entry point of one backing service implementation.
pub trait HiveBackend: Send + Sync {
    /// Configures DID resolution. Global to the backing service, so the
    /// bridge calls it at most once.
    fn setup_resolver(&self, resolver_url: &str, cache_dir: &Path) -> BackendResult<()>;

    /// Creates one client session. `auth` is invoked whenever the service
    /// needs the caller to sign a challenge.
    fn create_client(
        &self,
        options: ClientOptions,
        auth: Arc<dyn AuthHandler>,
    ) -> BackendResult<Arc<dyn HiveClient>>;
}

/// Challenge hook the backing service calls mid-login.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Returns the signed response for `challenge`, suspending until one exists.
    async fn authorize(&self, challenge: String) -> BackendResult<String>;
}

#[async_trait]
pub trait HiveClient: Send + Sync {
    /// Creates a vault; `None` means the service declined without an error.
    async fn create_vault(
        &self,
        owner_did: &str,
        provider_address: &str,
    ) -> BackendResult<Option<Arc<dyn Vault>>>;

    /// Looks up an existing vault; `None` means the service declined without an error.
    async fn get_vault(&self, owner_did: &str) -> BackendResult<Option<Arc<dyn Vault>>>;
}

#[async_trait]
pub trait Vault: Send + Sync {
    fn provider_address(&self) -> String;
    fn owner_did(&self) -> String;

    async fn node_version(&self) -> BackendResult<String>;
    async fn revoke_access_token(&self) -> BackendResult<()>;

    fn database(&self) -> &dyn VaultDatabase;
    fn files(&self) -> &dyn VaultFiles;
    fn scripting(&self) -> &dyn VaultScripting;
    fn payment(&self) -> &dyn VaultPayment;
}

#[async_trait]
pub trait VaultDatabase: Send + Sync {
    async fn create_collection(&self, name: &str) -> BackendResult<bool>;
    async fn delete_collection(&self, name: &str) -> BackendResult<bool>;
    async fn insert_one(&self, collection: &str, document: Value) -> BackendResult<InsertOneResult>;
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Value>,
    ) -> BackendResult<InsertManyResult>;
    async fn count_documents(&self, collection: &str, filter: Value) -> BackendResult<u64>;
    async fn find_one(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> BackendResult<Option<Value>>;
    async fn find_many(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> BackendResult<Vec<Value>>;
    async fn update(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
        only_one: bool,
    ) -> BackendResult<UpdateResult>;
    async fn delete(
        &self,
        collection: &str,
        filter: Value,
        only_one: bool,
    ) -> BackendResult<DeleteResult>;
}

#[async_trait]
pub trait VaultFiles: Send + Sync {
    async fn upload(&self, path: &str) -> BackendResult<WriteStream>;
    async fn download(&self, path: &str) -> BackendResult<ReadStream>;
    async fn delete(&self, path: &str) -> BackendResult<bool>;
    async fn move_file(&self, src: &str, dst: &str) -> BackendResult<bool>;
    async fn copy_file(&self, src: &str, dst: &str) -> BackendResult<bool>;
    async fn hash(&self, path: &str) -> BackendResult<String>;
    async fn list(&self, folder: &str) -> BackendResult<Vec<FileInfo>>;
    async fn stat(&self, path: &str) -> BackendResult<FileInfo>;
}

#[async_trait]
pub trait VaultScripting: Send + Sync {
    async fn set_script(
        &self,
        name: &str,
        executable: Value,
        condition: Option<Value>,
        allow_anonymous_user: bool,
        allow_anonymous_app: bool,
    ) -> BackendResult<bool>;
    async fn call_script(
        &self,
        name: &str,
        params: Option<Value>,
        target_did: Option<&str>,
        target_app_did: Option<&str>,
    ) -> BackendResult<Value>;
    async fn download_file(&self, transaction_id: &str) -> BackendResult<ReadStream>;
    async fn upload_file(&self, transaction_id: &str) -> BackendResult<WriteStream>;
}

#[async_trait]
pub trait VaultPayment: Send + Sync {
    async fn pricing_info(&self) -> BackendResult<Value>;
    async fn pricing_plan(&self, name: &str) -> BackendResult<Value>;
    async fn place_order(&self, plan_name: &str) -> BackendResult<String>;
    async fn pay_order(&self, order_id: &str, transaction_ids: Vec<String>) -> BackendResult<bool>;
    async fn get_order(&self, order_id: &str) -> BackendResult<Value>;
    async fn all_orders(&self) -> BackendResult<Vec<Value>>;
    async fn active_pricing_plan(&self) -> BackendResult<Value>;
    async fn payment_version(&self) -> BackendResult<String>;
}
