//! SQLite-backed local vault service.
//!
//! # Responsibility
//! - Provide an in-process implementation of the backing collaborator
//!   contracts for the CLI, the FFI default wiring and tests.
//! - Emit one authentication challenge per client session, like a remote
//!   vault node would.
//!
//! # Invariants
//! - Every SQLite call runs on a blocking worker, never on the async executor.
//! - Any non-empty challenge response authenticates; signature checks are
//!   out of scope here.

mod database;
pub mod db;
mod files;
mod payment;
mod scripting;

use crate::backend::{
    AuthHandler, ClientOptions, HiveBackend, HiveClient, Vault, VaultDatabase, VaultFiles,
    VaultPayment, VaultScripting,
};
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use async_trait::async_trait;
use database::LocalDatabase;
use files::LocalFiles;
use log::info;
use payment::LocalPayment;
use rusqlite::{params, Connection, OptionalExtension};
use scripting::LocalScripting;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub use db::{DbError, DbResult};

const LOCAL_NODE_VERSION: &str = "2.9.0-local";

pub(crate) type SharedConn = Arc<Mutex<Connection>>;

/// Local implementation of `HiveBackend`.
pub struct LocalBackend {
    conn: SharedConn,
    resolver: Mutex<Option<(String, PathBuf)>>,
}

impl LocalBackend {
    /// Opens (or creates) a local vault database file.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(db::open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(db::open_db_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            resolver: Mutex::new(None),
        }
    }

    /// Resolver settings recorded by `setup_resolver`.
    pub fn resolver(&self) -> Option<(String, PathBuf)> {
        self.resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HiveBackend for LocalBackend {
    fn setup_resolver(&self, resolver_url: &str, cache_dir: &Path) -> BackendResult<()> {
        std::fs::create_dir_all(cache_dir)?;
        *self.resolver.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((resolver_url.to_string(), cache_dir.to_path_buf()));
        Ok(())
    }

    fn create_client(
        &self,
        options: ClientOptions,
        auth: Arc<dyn AuthHandler>,
    ) -> BackendResult<Arc<dyn HiveClient>> {
        let document: serde_json::Value =
            serde_json::from_str(&options.authentication_did_document)?;
        let app_did = document
            .get("id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| BackendError::other("authentication DID document has no `id`"))?
            .to_string();

        Ok(Arc::new(LocalClient {
            conn: Arc::clone(&self.conn),
            session: Arc::new(AuthSession::new(app_did, auth)),
        }))
    }
}

/// Access-token state of one client session.
pub(crate) struct AuthSession {
    app_did: String,
    auth: Arc<dyn AuthHandler>,
    token: tokio::sync::Mutex<Option<String>>,
}

impl AuthSession {
    fn new(app_did: String, auth: Arc<dyn AuthHandler>) -> Self {
        Self {
            app_did,
            auth,
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// Runs the challenge flow unless the session already holds a token.
    ///
    /// Concurrent callers wait on the same login instead of issuing a second
    /// challenge.
    pub(crate) async fn ensure(&self) -> BackendResult<()> {
        let mut token = self.token.lock().await;
        if token.is_some() {
            return Ok(());
        }

        let challenge = format!("hive-auth-challenge:{}:{}", self.app_did, Uuid::new_v4());
        let response = self.auth.authorize(challenge).await?;
        if response.trim().is_empty() {
            return Err(BackendError::new(
                BackendErrorKind::Auth,
                "challenge response must not be empty",
            ));
        }
        *token = Some(format!("access-{}", Uuid::new_v4()));
        info!("event=local_auth module=local_backend status=ok");
        Ok(())
    }

    async fn revoke(&self) {
        *self.token.lock().await = None;
    }
}

struct LocalClient {
    conn: SharedConn,
    session: Arc<AuthSession>,
}

impl LocalClient {
    fn vault(&self, owner_did: String, provider_address: String) -> Arc<dyn Vault> {
        let context = VaultContext {
            conn: Arc::clone(&self.conn),
            owner_did,
            session: Arc::clone(&self.session),
        };
        Arc::new(LocalVault {
            provider_address,
            database: LocalDatabase::new(context.clone()),
            files: LocalFiles::new(context.clone()),
            scripting: LocalScripting::new(context.clone()),
            payment: LocalPayment::new(context.clone()),
            context,
        })
    }
}

#[async_trait]
impl HiveClient for LocalClient {
    async fn create_vault(
        &self,
        owner_did: &str,
        provider_address: &str,
    ) -> BackendResult<Option<Arc<dyn Vault>>> {
        check_owner_did(owner_did)?;
        let provider = provider_address.trim().to_string();
        if provider.is_empty() {
            return Err(BackendError::new(
                BackendErrorKind::ProviderNotSet,
                "vault provider address is not set",
            ));
        }
        if !provider.starts_with("http://") && !provider.starts_with("https://") {
            return Err(BackendError::new(
                BackendErrorKind::ProviderNotPublished,
                format!("vault provider is not published: {provider}"),
            ));
        }
        self.session.ensure().await?;

        let owner = owner_did.to_string();
        let stored_provider = provider.clone();
        let inserted = with_conn(&self.conn, move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO vaults (owner_did, provider_address, created_at)
                 VALUES (?1, ?2, ?3)",
                params![owner, stored_provider, now_epoch_ms()],
            )?;
            Ok(changed == 1)
        })
        .await?;
        if !inserted {
            return Err(BackendError::new(
                BackendErrorKind::VaultAlreadyExists,
                format!("vault already exists for {owner_did}"),
            ));
        }

        Ok(Some(self.vault(owner_did.to_string(), provider)))
    }

    async fn get_vault(&self, owner_did: &str) -> BackendResult<Option<Arc<dyn Vault>>> {
        check_owner_did(owner_did)?;
        self.session.ensure().await?;

        let owner = owner_did.to_string();
        let provider = with_conn(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT provider_address FROM vaults WHERE owner_did = ?1",
                    [owner.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await?;

        match provider {
            Some(provider) => Ok(Some(self.vault(owner_did.to_string(), provider))),
            None => Err(BackendError::new(
                BackendErrorKind::VaultNotFound,
                format!("vault not found for {owner_did}"),
            )),
        }
    }
}

/// Per-vault state shared by the four service groups.
#[derive(Clone)]
pub(crate) struct VaultContext {
    pub(crate) conn: SharedConn,
    pub(crate) owner_did: String,
    pub(crate) session: Arc<AuthSession>,
}

impl VaultContext {
    /// Ensures authentication, then runs `f` on a blocking worker.
    pub(crate) async fn run<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Connection, &str) -> BackendResult<T> + Send + 'static,
    ) -> BackendResult<T> {
        self.session.ensure().await?;
        let owner = self.owner_did.clone();
        with_conn(&self.conn, move |conn| f(conn, owner.as_str())).await
    }
}

struct LocalVault {
    context: VaultContext,
    provider_address: String,
    database: LocalDatabase,
    files: LocalFiles,
    scripting: LocalScripting,
    payment: LocalPayment,
}

#[async_trait]
impl Vault for LocalVault {
    fn provider_address(&self) -> String {
        self.provider_address.clone()
    }

    fn owner_did(&self) -> String {
        self.context.owner_did.clone()
    }

    async fn node_version(&self) -> BackendResult<String> {
        self.context.session.ensure().await?;
        Ok(LOCAL_NODE_VERSION.to_string())
    }

    async fn revoke_access_token(&self) -> BackendResult<()> {
        self.context.session.revoke().await;
        Ok(())
    }

    fn database(&self) -> &dyn VaultDatabase {
        &self.database
    }

    fn files(&self) -> &dyn VaultFiles {
        &self.files
    }

    fn scripting(&self) -> &dyn VaultScripting {
        &self.scripting
    }

    fn payment(&self) -> &dyn VaultPayment {
        &self.payment
    }
}

pub(crate) async fn with_conn<T: Send + 'static>(
    conn: &SharedConn,
    f: impl FnOnce(&Connection) -> BackendResult<T> + Send + 'static,
) -> BackendResult<T> {
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    })
    .await
    .map_err(|err| BackendError::other(format!("local storage worker failed: {err}")))?
}

impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        BackendError::other(format!("local storage error: {value}"))
    }
}

fn check_owner_did(owner_did: &str) -> BackendResult<()> {
    if owner_did.trim().starts_with("did:") {
        return Ok(());
    }
    Err(BackendError::new(
        BackendErrorKind::DidNotPublished,
        format!("DID is not published: {owner_did}"),
    ))
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
