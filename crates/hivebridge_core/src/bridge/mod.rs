//! Caller-facing bridge surface.
//!
//! # Responsibility
//! - Expose one entry point per caller command, each replying exactly once
//!   through a `ReplySink` (challenge channel registration excepted).
//! - Resolve caller handles before any backing call and register created
//!   objects before replying with their handle.
//!
//! # Invariants
//! - Entry points never block: backing work runs on the bridge runtime or
//!   on blocking workers.
//! - Bridge-side failures (`HandleNotFound`, `ProtocolViolation`,
//!   `InvalidArgument`) are replied directly; backing failures go through
//!   the normalizer exactly once.
//! - DID resolver setup happens at most once per bridge and is retried when
//!   it fails.

mod streams;
mod vault;

use crate::backend::{ClientOptions, HiveBackend, HiveClient, Vault};
use crate::completion::{CompletionBridge, Reply, ReplySink};
use crate::config::{BridgeConfig, ConfigError};
use crate::error::{normalize, BackendErrorKind, BackendResult, StructuredError};
use crate::handle::{Handle, HandleObject, HandleRegistry, OwnerReleased};
use crate::rendezvous::{ChallengeRendezvous, ChallengeSink, RendezvousAuthHandler};
use crate::stream::StreamSessions;
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle as RuntimeHandle;

/// Owns every piece of caller-visible bridge state.
pub struct HiveBridge {
    backend: Arc<dyn HiveBackend>,
    config: BridgeConfig,
    registry: Arc<HandleRegistry>,
    rendezvous: Arc<ChallengeRendezvous>,
    completion: CompletionBridge,
    streams: StreamSessions,
    resolver_ready: OnceCell<()>,
}

impl HiveBridge {
    /// Builds a bridge that runs backing work on `runtime`.
    pub fn new(
        backend: Arc<dyn HiveBackend>,
        config: BridgeConfig,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(HandleRegistry::new());
        let streams = StreamSessions::new(Arc::clone(&registry), config.read_chunk_bytes);
        Ok(Self {
            backend,
            registry,
            rendezvous: Arc::new(ChallengeRendezvous::new()),
            completion: CompletionBridge::new(runtime),
            streams,
            resolver_ready: OnceCell::new(),
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn rendezvous(&self) -> &ChallengeRendezvous {
        &self.rendezvous
    }

    /// Creates a backing client and replies `{"objectId": <client handle>}`.
    pub fn get_client(&self, options: Option<Value>, reply: ReplySink) {
        const ACTION: &str = "getClient";
        let Some(options) = options.filter(|value| !value.is_null()) else {
            return self.completion.reject(
                ACTION,
                StructuredError::invalid_argument("Client creation options must be provided"),
                reply,
            );
        };
        let options: ClientOptions = match serde_json::from_value(options) {
            Ok(options) => options,
            Err(err) => {
                return self.completion.reject(
                    ACTION,
                    StructuredError::invalid_argument(format!(
                        "invalid client creation options: {err}"
                    )),
                    reply,
                )
            }
        };

        let outcome = self.ensure_resolver().and_then(|()| {
            let backend = Arc::clone(&self.backend);
            let rendezvous = Arc::clone(&self.rendezvous);
            let timeout = self.config.challenge_timeout;
            self.registry.try_allocate_with(move |handle| {
                let auth = Arc::new(RendezvousAuthHandler::new(handle, rendezvous, timeout));
                backend
                    .create_client(options, auth)
                    .map(HandleObject::Client)
            })
        });

        let outcome = match outcome {
            Ok(handle) => Reply::Success(json!({ "objectId": handle.to_string() })),
            Err(err) => Reply::Failure(normalize(&err)),
        };
        self.completion.reply_now(ACTION, outcome, reply);
    }

    /// Registers the multi-shot channel that receives this client's
    /// challenges. Never replies on its own.
    pub fn client_set_auth_challenge_channel(
        &self,
        client_id: &str,
        channel: ChallengeSink,
    ) -> Result<(), StructuredError> {
        let client = parse_handle(client_id)?;
        self.registry.resolve_client(client)?;
        self.rendezvous.register_channel(client, channel);
        Ok(())
    }

    /// Completes the pending challenge of a client with the caller's response.
    pub fn client_send_auth_challenge_response(
        &self,
        client_id: &str,
        response: Option<String>,
        reply: ReplySink,
    ) {
        const ACTION: &str = "client_sendAuthHandlerChallengeResponse";
        let outcome = (|| -> Result<Value, StructuredError> {
            let client = parse_handle(client_id)?;
            self.registry.resolve_client(client)?;
            let response = response
                .ok_or_else(|| StructuredError::invalid_argument("Empty challenge response given!"))?;
            self.rendezvous.resolve(client, response)?;
            Ok(Value::Null)
        })();
        self.completion.reply_now(ACTION, outcome.into(), reply);
    }

    /// Creates a vault. Replies `null` when no provider is set or the vault
    /// already exists.
    pub fn client_create_vault(
        &self,
        client_id: &str,
        owner_did: Option<String>,
        provider_address: Option<String>,
        reply: ReplySink,
    ) {
        const ACTION: &str = "client_createVault";
        let prepared = (|| -> Result<(Handle, Arc<dyn HiveClient>, String, String), StructuredError> {
            let client = parse_handle(client_id)?;
            let owner_did = owner_did.ok_or_else(|| {
                StructuredError::invalid_argument(
                    "createVault() cannot be called with a null string as vault owner DID",
                )
            })?;
            let provider_address = provider_address.ok_or_else(|| {
                StructuredError::invalid_argument(
                    "createVault() cannot be called with a null string as vault provider address",
                )
            })?;
            Ok((client, self.registry.resolve_client(client)?, owner_did, provider_address))
        })();
        let (handle, client, owner_did, provider_address) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };

        let operation = async move {
            match client.create_vault(&owner_did, &provider_address).await {
                Ok(vault) => Ok(vault),
                Err(err)
                    if err.is(BackendErrorKind::ProviderNotSet)
                        || err.is(BackendErrorKind::VaultAlreadyExists) =>
                {
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        };
        let registry = Arc::clone(&self.registry);
        let runtime = self.completion.runtime().clone();
        self.completion.complete_with(
            ACTION,
            operation,
            move |vault| register_vault(&registry, &runtime, handle, vault),
            reply,
        );
    }

    /// Opens an existing vault. Replies `null` when no provider is set.
    pub fn client_get_vault(&self, client_id: &str, owner_did: Option<String>, reply: ReplySink) {
        const ACTION: &str = "client_getVault";
        let prepared = (|| -> Result<(Handle, Arc<dyn HiveClient>, String), StructuredError> {
            let client = parse_handle(client_id)?;
            let owner_did = owner_did.ok_or_else(|| {
                StructuredError::invalid_argument(
                    "getVault() cannot be called with a null string as vault owner DID",
                )
            })?;
            Ok((client, self.registry.resolve_client(client)?, owner_did))
        })();
        let (handle, client, owner_did) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };

        let operation = async move {
            match client.get_vault(&owner_did).await {
                Err(err) if err.is(BackendErrorKind::ProviderNotSet) => Ok(None),
                other => other,
            }
        };
        let registry = Arc::clone(&self.registry);
        let runtime = self.completion.runtime().clone();
        self.completion.complete_with(
            ACTION,
            operation,
            move |vault| register_vault(&registry, &runtime, handle, vault),
            reply,
        );
    }

    /// Tears down a client session: releases the client with every vault
    /// and stream it owns, and cancels a pending challenge.
    pub fn client_close(&self, client_id: &str, reply: ReplySink) {
        const ACTION: &str = "client_close";
        let client = match parse_handle(client_id)
            .and_then(|handle| self.registry.resolve_client(handle).map(|_| handle))
        {
            Ok(handle) => handle,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };

        if self.rendezvous.cancel(client) {
            warn!(
                "event=client_close module=bridge status=ok client={} cancelled_challenge=true",
                client
            );
        }
        self.rendezvous.remove(client);
        let released = self.registry.release_tree(client);
        info!(
            "event=client_close module=bridge status=ok client={} released_count={}",
            client,
            released.len()
        );

        // Writers may persist on drop, so the objects go away on a worker.
        self.completion.complete_blocking(
            ACTION,
            move || {
                drop(released);
                Ok(())
            },
            |()| Value::Null,
            reply,
        );
    }

    fn ensure_resolver(&self) -> BackendResult<()> {
        self.resolver_ready
            .get_or_try_init(|| -> BackendResult<()> {
                self.backend
                    .setup_resolver(&self.config.did_resolver_url, &self.config.did_cache_dir)?;
                info!(
                    "event=resolver_setup module=bridge status=ok cache_dir={}",
                    self.config.did_cache_dir.display()
                );
                Ok(())
            })
            .map(|_| ())
    }

    fn resolve_vault(&self, vault_id: &str) -> Result<(Handle, Arc<dyn Vault>), StructuredError> {
        let handle = parse_handle(vault_id)?;
        Ok((handle, self.registry.resolve_vault(handle)?))
    }

    /// Resolves `vault_id` and relays the outcome of `call` on it.
    fn vault_call<T, Fut, P>(
        &self,
        action: &'static str,
        vault_id: &str,
        reply: ReplySink,
        call: impl FnOnce(Handle, Arc<dyn Vault>) -> Fut,
        project: P,
    ) where
        T: Send + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
        P: FnOnce(T) -> Value + Send + 'static,
    {
        self.vault_call_with(action, vault_id, reply, call, move |value| {
            Reply::Success(project(value))
        });
    }

    /// Like `vault_call`, but the projector decides the final reply.
    fn vault_call_with<T, Fut, P>(
        &self,
        action: &'static str,
        vault_id: &str,
        reply: ReplySink,
        call: impl FnOnce(Handle, Arc<dyn Vault>) -> Fut,
        project: P,
    ) where
        T: Send + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
        P: FnOnce(T) -> Reply + Send + 'static,
    {
        match self.resolve_vault(vault_id) {
            Ok((handle, vault)) => {
                self.completion
                    .complete_with(action, call(handle, vault), project, reply)
            }
            Err(err) => self.completion.reject(action, err, reply),
        }
    }
}

/// Caller tokens that do not parse can never name a live object.
fn parse_handle(raw: &str) -> Result<Handle, StructuredError> {
    raw.parse::<Handle>()
        .map_err(|_| StructuredError::handle_not_found(raw))
}

fn register_vault(
    registry: &HandleRegistry,
    runtime: &RuntimeHandle,
    client: Handle,
    vault: Option<Arc<dyn Vault>>,
) -> Reply {
    let Some(vault) = vault else {
        return Reply::Success(Value::Null);
    };
    let provider_address = vault.provider_address();
    let owner_did = vault.owner_did();
    registered(
        runtime,
        registry.allocate_owned(HandleObject::Vault(vault), client),
        |handle| {
            json!({
                "objectId": handle.to_string(),
                "vaultProviderAddress": provider_address,
                "vaultOwnerDid": owner_did,
            })
        },
    )
}

/// Replies the new handle, or `HandleNotFound` when the owning session was
/// closed while the object was being opened.
///
/// A refused object is dropped on a blocking worker; writers persist on drop.
fn registered(
    runtime: &RuntimeHandle,
    outcome: Result<Handle, OwnerReleased>,
    payload: impl FnOnce(Handle) -> Value,
) -> Reply {
    match outcome {
        Ok(handle) => Reply::Success(payload(handle)),
        Err(refused) => {
            let err = refused.error();
            warn!(
                "event=handle_allocate module=bridge status=error kind={} owner={} error_code=owner_released",
                refused.object.kind(),
                refused.owner
            );
            drop(runtime.spawn_blocking(move || drop(refused)));
            Reply::Failure(err)
        }
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, StructuredError> {
    value.ok_or_else(|| StructuredError::invalid_argument(format!("{what} must be provided")))
}
