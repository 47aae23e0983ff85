//! Flat command dispatch onto the bridge surface.
//!
//! # Responsibility
//! - Map `action + positional JSON args` onto `HiveBridge` entry points.
//! - Wrap every reply in the caller envelope.
//! - Keep one challenge queue per client for the multi-shot challenge surface.
//!
//! # Invariants
//! - Argument extraction never panics; bad arguments reply `InvalidArgument`.
//! - Every dispatched action replies exactly once.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hivebridge_core::{
    ChallengeSink, ErrorCode, Handle, HiveBridge, Reply, ReplySink, StructuredError,
};
use log::warn;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type ChallengeQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>;
type Start<'a> = Box<dyn FnOnce(ReplySink) + 'a>;

/// Caller reply envelope.
pub fn envelope(reply: Reply) -> Value {
    match reply {
        Reply::Success(payload) => json!({ "ok": true, "payload": payload }),
        Reply::Failure(err) => json!({ "ok": false, "error": err.to_json() }),
    }
}

/// Routes caller commands to one bridge.
pub struct Dispatcher {
    bridge: HiveBridge,
    challenges: Mutex<HashMap<Handle, ChallengeQueue>>,
}

impl Dispatcher {
    pub fn new(bridge: HiveBridge) -> Self {
        Self {
            bridge,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    pub fn bridge(&self) -> &HiveBridge {
        &self.bridge
    }

    /// Parses `args_json`, runs `action` and waits for its enveloped reply.
    pub async fn execute_json(&self, action: &str, args_json: &str) -> Value {
        let (sink, rx) = ReplySink::channel();
        match parse_args(args_json) {
            Ok(args) => self.execute(action, args, sink),
            Err(err) => reject(action, err, sink),
        }
        let reply = rx.await.unwrap_or_else(|_| {
            Reply::Failure(StructuredError::new(
                ErrorCode::Unspecified,
                format!("{action} finished without a reply"),
            ))
        });
        envelope(reply)
    }

    /// Runs `action` with positional `args`, replying through `reply`.
    pub fn execute(&self, action: &str, args: Vec<Value>, reply: ReplySink) {
        match self.route(action, &Args(args)) {
            Ok(start) => start(reply),
            Err(err) => reject(action, err, reply),
        }
    }

    /// Opens the challenge queue of `client_id`, replacing a previous one.
    ///
    /// Queues are keyed by the parsed handle, so every spelling of one
    /// client id reaches the same queue.
    pub fn register_challenge_channel(&self, client_id: &str) -> Result<(), StructuredError> {
        let client = client_id
            .parse::<Handle>()
            .map_err(|_| StructuredError::handle_not_found(client_id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.bridge
            .client_set_auth_challenge_channel(client_id, ChallengeSink::from_sender(tx))?;
        self.queues()
            .insert(client, Arc::new(tokio::sync::Mutex::new(rx)));
        Ok(())
    }

    /// Waits for the next challenge pushed to `client_id`.
    ///
    /// `None` when no queue is registered or the client was closed.
    pub async fn next_challenge(&self, client_id: &str) -> Option<String> {
        let client = client_id.parse::<Handle>().ok()?;
        let queue = self.queues().get(&client).cloned()?;
        let mut receiver = queue.lock().await;
        receiver.recv().await
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, ChallengeQueue>> {
        self.challenges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route<'a>(&'a self, action: &str, args: &Args) -> Result<Start<'a>, StructuredError> {
        let bridge = &self.bridge;
        let start: Start<'a> = match action {
            "getClient" => {
                let options = args.value(0);
                Box::new(move |reply| bridge.get_client(options, reply))
            }
            "client_setAuthHandlerChallengeCallback" => {
                let client = args.handle(0, "client")?;
                self.register_challenge_channel(&client)?;
                Box::new(|reply: ReplySink| reply.success(Value::Null))
            }
            "client_sendAuthHandlerChallengeResponse" => {
                let client = args.handle(0, "client")?;
                let response = args.opt_string(1, "challenge response")?;
                Box::new(move |reply| {
                    bridge.client_send_auth_challenge_response(&client, response, reply)
                })
            }
            "client_createVault" => {
                let client = args.handle(0, "client")?;
                let owner_did = args.opt_string(1, "vault owner DID")?;
                let provider = args.opt_string(2, "vault provider address")?;
                Box::new(move |reply| {
                    bridge.client_create_vault(&client, owner_did, provider, reply)
                })
            }
            "client_getVault" => {
                let client = args.handle(0, "client")?;
                let owner_did = args.opt_string(1, "vault owner DID")?;
                Box::new(move |reply| bridge.client_get_vault(&client, owner_did, reply))
            }
            "client_close" => {
                let client = args.handle(0, "client")?;
                if let Ok(handle) = client.parse::<Handle>() {
                    self.queues().remove(&handle);
                }
                Box::new(move |reply| bridge.client_close(&client, reply))
            }

            "vault_getNodeVersion" => {
                let vault = args.handle(0, "vault")?;
                Box::new(move |reply| bridge.vault_get_node_version(&vault, reply))
            }
            "vault_revokeAccessToken" => {
                let vault = args.handle(0, "vault")?;
                Box::new(move |reply| bridge.vault_revoke_access_token(&vault, reply))
            }

            "database_createCollection" | "database_deleteCollection" => {
                let vault = args.handle(0, "vault")?;
                let name = args.string(1, "collection name")?;
                if action == "database_createCollection" {
                    Box::new(move |reply| bridge.database_create_collection(&vault, name, reply))
                } else {
                    Box::new(move |reply| bridge.database_delete_collection(&vault, name, reply))
                }
            }
            "database_insertOne" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let document = args.value(2);
                Box::new(move |reply| {
                    bridge.database_insert_one(&vault, collection, document, reply)
                })
            }
            "database_insertMany" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let documents = args.array(2, "documents")?;
                Box::new(move |reply| {
                    bridge.database_insert_many(&vault, collection, documents, reply)
                })
            }
            "database_countDocuments" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let filter = args.value(2);
                Box::new(move |reply| {
                    bridge.database_count_documents(&vault, collection, filter, reply)
                })
            }
            "database_findOne" | "database_findMany" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let filter = args.value(2);
                let options = args.value(3);
                if action == "database_findOne" {
                    Box::new(move |reply| {
                        bridge.database_find_one(&vault, collection, filter, options, reply)
                    })
                } else {
                    Box::new(move |reply| {
                        bridge.database_find_many(&vault, collection, filter, options, reply)
                    })
                }
            }
            "database_updateOne" | "database_updateMany" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let filter = args.value(2);
                let update = args.value(3);
                let only_one = action == "database_updateOne";
                Box::new(move |reply| {
                    bridge.database_update(&vault, collection, filter, update, only_one, reply)
                })
            }
            "database_deleteOne" | "database_deleteMany" => {
                let vault = args.handle(0, "vault")?;
                let collection = args.string(1, "collection name")?;
                let filter = args.value(2);
                let only_one = action == "database_deleteOne";
                Box::new(move |reply| {
                    bridge.database_delete(&vault, collection, filter, only_one, reply)
                })
            }

            "files_upload" | "files_download" | "files_delete" | "files_hash" | "files_list"
            | "files_stat" => {
                let vault = args.handle(0, "vault")?;
                let path = args.string(1, "path")?;
                let action = action.to_string();
                Box::new(move |reply| match action.as_str() {
                    "files_upload" => bridge.files_upload(&vault, path, reply),
                    "files_download" => bridge.files_download(&vault, path, reply),
                    "files_delete" => bridge.files_delete(&vault, path, reply),
                    "files_hash" => bridge.files_hash(&vault, path, reply),
                    "files_list" => bridge.files_list(&vault, path, reply),
                    _ => bridge.files_stat(&vault, path, reply),
                })
            }
            "files_move" | "files_copy" => {
                let vault = args.handle(0, "vault")?;
                let src = args.string(1, "source path")?;
                let dst = args.string(2, "destination path")?;
                if action == "files_move" {
                    Box::new(move |reply| bridge.files_move(&vault, src, dst, reply))
                } else {
                    Box::new(move |reply| bridge.files_copy(&vault, src, dst, reply))
                }
            }

            "scripting_setScript" => {
                let vault = args.handle(0, "vault")?;
                let name = args.string(1, "script name")?;
                let executable = args.value(2);
                let condition = args.value(3);
                let allow_anonymous_user = args.flag(4, "allowAnonymousUser")?;
                let allow_anonymous_app = args.flag(5, "allowAnonymousApp")?;
                Box::new(move |reply| {
                    bridge.scripting_set_script(
                        &vault,
                        name,
                        executable,
                        condition,
                        allow_anonymous_user,
                        allow_anonymous_app,
                        reply,
                    )
                })
            }
            "scripting_call" => {
                let vault = args.handle(0, "vault")?;
                let name = args.string(1, "script name")?;
                let params = args.value(2);
                let target_app_did = args.opt_string(3, "target app DID")?;
                let target_did = args.opt_string(4, "target DID")?;
                Box::new(move |reply| {
                    bridge.scripting_call(&vault, name, params, target_did, target_app_did, reply)
                })
            }
            "scripting_downloadFile" | "scripting_uploadFile" => {
                let vault = args.handle(0, "vault")?;
                let transaction_id = args.string(1, "transaction id")?;
                if action == "scripting_downloadFile" {
                    Box::new(move |reply| {
                        bridge.scripting_download_file(&vault, transaction_id, reply)
                    })
                } else {
                    Box::new(move |reply| {
                        bridge.scripting_upload_file(&vault, transaction_id, reply)
                    })
                }
            }

            "writer_write" => {
                let writer = args.handle(0, "writer")?;
                let data = args.bytes(1, "data")?;
                Box::new(move |reply| bridge.writer_write(&writer, data, reply))
            }
            "writer_flush" => {
                let writer = args.handle(0, "writer")?;
                Box::new(move |reply| bridge.writer_flush(&writer, reply))
            }
            "writer_close" => {
                let writer = args.handle(0, "writer")?;
                Box::new(move |reply| bridge.writer_close(&writer, reply))
            }
            "reader_read" => {
                let reader = args.handle(0, "reader")?;
                let max_bytes = args.int(1, "bytesCount")?;
                Box::new(move |reply| bridge.reader_read(&reader, max_bytes, reply))
            }
            "reader_readAll" => {
                let reader = args.handle(0, "reader")?;
                Box::new(move |reply| bridge.reader_read_all(&reader, reply))
            }
            "reader_close" => {
                let reader = args.handle(0, "reader")?;
                Box::new(move |reply| bridge.reader_close(&reader, reply))
            }

            "payment_getPricingInfo"
            | "payment_getAllOrders"
            | "payment_getActivePricingPlan"
            | "payment_getPaymentVersion" => {
                let vault = args.handle(0, "vault")?;
                let action = action.to_string();
                Box::new(move |reply| match action.as_str() {
                    "payment_getPricingInfo" => bridge.payment_get_pricing_info(&vault, reply),
                    "payment_getAllOrders" => bridge.payment_get_all_orders(&vault, reply),
                    "payment_getActivePricingPlan" => {
                        bridge.payment_get_active_pricing_plan(&vault, reply)
                    }
                    _ => bridge.payment_get_payment_version(&vault, reply),
                })
            }
            "payment_getPricingPlan" | "payment_placeOrder" => {
                let vault = args.handle(0, "vault")?;
                let plan_name = args.string(1, "pricing plan name")?;
                if action == "payment_getPricingPlan" {
                    Box::new(move |reply| bridge.payment_get_pricing_plan(&vault, plan_name, reply))
                } else {
                    Box::new(move |reply| bridge.payment_place_order(&vault, plan_name, reply))
                }
            }
            "payment_getOrder" => {
                let vault = args.handle(0, "vault")?;
                let order_id = args.string(1, "order id")?;
                Box::new(move |reply| bridge.payment_get_order(&vault, order_id, reply))
            }
            "payment_payOrder" => {
                let vault = args.handle(0, "vault")?;
                let order_id = args.string(1, "order id")?;
                let transaction_ids = args.strings(2, "transaction ids")?;
                Box::new(move |reply| {
                    bridge.payment_pay_order(&vault, order_id, transaction_ids, reply)
                })
            }

            unknown => {
                return Err(StructuredError::invalid_argument(format!(
                    "unknown action `{unknown}`"
                )))
            }
        };
        Ok(start)
    }
}

fn reject(action: &str, err: StructuredError, reply: ReplySink) {
    warn!(
        "event=dispatch module=ffi status=error action={} error_code={}",
        action,
        err.code.value()
    );
    reply.failure(err);
}

fn parse_args(args_json: &str) -> Result<Vec<Value>, StructuredError> {
    if args_json.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(args_json) {
        Ok(Value::Array(args)) => Ok(args),
        Ok(Value::Null) => Ok(Vec::new()),
        Ok(_) => Err(StructuredError::invalid_argument(
            "arguments must be a JSON array",
        )),
        Err(err) => Err(StructuredError::invalid_argument(format!(
            "arguments are not valid JSON: {err}"
        ))),
    }
}

/// Positional arguments; a missing position reads as `null`.
struct Args(Vec<Value>);

impl Args {
    fn get(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&Value::Null)
    }

    fn value(&self, index: usize) -> Option<Value> {
        Some(self.get(index).clone()).filter(|value| !value.is_null())
    }

    fn opt_string(&self, index: usize, what: &str) -> Result<Option<String>, StructuredError> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value.clone())),
            _ => Err(wrong_type(what, "a string")),
        }
    }

    fn string(&self, index: usize, what: &str) -> Result<String, StructuredError> {
        self.opt_string(index, what)?
            .ok_or_else(|| missing(what))
    }

    /// Handles arrive as strings; bare integers are accepted too.
    fn handle(&self, index: usize, what: &str) -> Result<String, StructuredError> {
        match self.get(index) {
            Value::String(value) => Ok(value.clone()),
            Value::Number(value) if value.is_u64() => Ok(value.to_string()),
            Value::Null => Err(missing(what)),
            _ => Err(wrong_type(what, "a handle")),
        }
    }

    fn flag(&self, index: usize, what: &str) -> Result<bool, StructuredError> {
        match self.get(index) {
            Value::Null => Ok(false),
            Value::Bool(value) => Ok(*value),
            _ => Err(wrong_type(what, "a boolean")),
        }
    }

    fn int(&self, index: usize, what: &str) -> Result<i64, StructuredError> {
        match self.get(index) {
            Value::Number(value) => value.as_i64().ok_or_else(|| wrong_type(what, "an integer")),
            Value::Null => Err(missing(what)),
            _ => Err(wrong_type(what, "an integer")),
        }
    }

    fn array(&self, index: usize, what: &str) -> Result<Option<Vec<Value>>, StructuredError> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Array(items) => Ok(Some(items.clone())),
            _ => Err(wrong_type(what, "an array")),
        }
    }

    fn strings(&self, index: usize, what: &str) -> Result<Vec<String>, StructuredError> {
        self.array(index, what)?
            .ok_or_else(|| missing(what))?
            .into_iter()
            .map(|item| match item {
                Value::String(value) => Ok(value),
                _ => Err(wrong_type(what, "an array of strings")),
            })
            .collect()
    }

    fn bytes(&self, index: usize, what: &str) -> Result<Vec<u8>, StructuredError> {
        let encoded = self.string(index, what)?;
        STANDARD.decode(encoded.as_bytes()).map_err(|err| {
            StructuredError::invalid_argument(format!("{what} is not valid base64: {err}"))
        })
    }
}

fn missing(what: &str) -> StructuredError {
    StructuredError::invalid_argument(format!("{what} must be provided"))
}

fn wrong_type(what: &str, expected: &str) -> StructuredError {
    StructuredError::invalid_argument(format!("{what} must be {expected}"))
}

#[cfg(test)]
mod tests {
    use super::{envelope, parse_args, Dispatcher};
    use hivebridge_core::{BridgeConfig, ErrorCode, HiveBridge, LocalBackend, Reply};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    const OWNER_DID: &str = "did:elastos:owner";

    fn dispatcher() -> (Dispatcher, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            did_cache_dir: dir.path().join("didCache"),
            ..BridgeConfig::default()
        };
        let backend = Arc::new(LocalBackend::open_in_memory().unwrap());
        let bridge =
            HiveBridge::new(backend, config, tokio::runtime::Handle::current()).unwrap();
        (Dispatcher::new(bridge), dir)
    }

    async fn run(dispatcher: &Dispatcher, action: &str, args: Value) -> Value {
        dispatcher.execute_json(action, &args.to_string()).await
    }

    async fn payload(dispatcher: &Dispatcher, action: &str, args: Value) -> Value {
        let reply = run(dispatcher, action, args).await;
        assert_eq!(reply["ok"], true, "{action}: {reply}");
        reply["payload"].clone()
    }

    fn error_code(reply: &Value) -> i64 {
        assert_eq!(reply["ok"], false, "{reply}");
        reply["error"]["code"].as_i64().unwrap()
    }

    #[test]
    fn envelope_wraps_both_outcomes() {
        assert_eq!(
            envelope(Reply::Success(json!(1))),
            json!({ "ok": true, "payload": 1 })
        );
        let failure = envelope(Reply::Failure(
            hivebridge_core::StructuredError::invalid_argument("bad"),
        ));
        assert_eq!(failure["error"]["code"], ErrorCode::InvalidArgument.value());
        assert_eq!(failure["error"]["message"], "bad");
    }

    #[test]
    fn args_must_be_an_array() {
        assert!(parse_args("").unwrap().is_empty());
        assert!(parse_args("null").unwrap().is_empty());
        assert!(parse_args("{\"a\":1}").is_err());
        assert!(parse_args("[1,").is_err());
    }

    #[tokio::test]
    async fn unknown_action_and_bad_arguments_are_invalid() {
        let (dispatcher, _dir) = dispatcher();
        let invalid = i64::from(ErrorCode::InvalidArgument.value());

        let reply = run(&dispatcher, "vault_explode", json!([])).await;
        assert_eq!(error_code(&reply), invalid);

        let reply = run(&dispatcher, "files_hash", json!(["1"])).await;
        assert_eq!(error_code(&reply), invalid);

        let reply = run(&dispatcher, "reader_read", json!(["1", "ten"])).await;
        assert_eq!(error_code(&reply), invalid);

        let reply = run(&dispatcher, "writer_write", json!(["1", "not base64!"])).await;
        assert_eq!(error_code(&reply), invalid);

        let reply = dispatcher.execute_json("getClient", "{").await;
        assert_eq!(error_code(&reply), invalid);
    }

    #[tokio::test]
    async fn unknown_handle_is_reported_through_envelope() {
        let (dispatcher, _dir) = dispatcher();
        let reply = run(&dispatcher, "vault_getNodeVersion", json!(["12345"])).await;
        assert_eq!(
            error_code(&reply),
            i64::from(ErrorCode::HandleNotFound.value())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_then_file_round_trip() {
        let (dispatcher, _dir) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let client = payload(
            &dispatcher,
            "getClient",
            json!([{ "authenticationDIDDocument": "{\"id\":\"did:elastos:app\"}" }]),
        )
        .await["objectId"]
            .as_str()
            .unwrap()
            .to_string();
        payload(
            &dispatcher,
            "client_setAuthHandlerChallengeCallback",
            json!([client]),
        )
        .await;

        let create = {
            let dispatcher = Arc::clone(&dispatcher);
            let client = client.clone();
            tokio::spawn(async move {
                run(
                    &dispatcher,
                    "client_createVault",
                    json!([client, OWNER_DID, "https://hive.local"]),
                )
                .await
            })
        };
        let challenge = dispatcher.next_challenge(&client).await.unwrap();
        assert!(!challenge.is_empty());
        payload(
            &dispatcher,
            "client_sendAuthHandlerChallengeResponse",
            json!([client, "signed"]),
        )
        .await;
        let vault = create.await.unwrap();
        assert_eq!(vault["ok"], true, "{vault}");
        let vault = vault["payload"]["objectId"].as_str().unwrap().to_string();

        let writer = payload(&dispatcher, "files_upload", json!([vault, "docs/a.txt"])).await;
        let writer = writer["objectId"].as_str().unwrap().to_string();
        payload(&dispatcher, "writer_write", json!([writer, "aGVsbG8="])).await;
        payload(&dispatcher, "writer_close", json!([writer])).await;

        let reader = payload(&dispatcher, "files_download", json!([vault, "docs/a.txt"])).await;
        let reader = reader["objectId"].as_str().unwrap().to_string();
        assert_eq!(
            payload(&dispatcher, "reader_readAll", json!([reader])).await,
            "aGVsbG8="
        );
        payload(&dispatcher, "reader_close", json!([reader])).await;

        payload(&dispatcher, "client_close", json!([client])).await;
        assert_eq!(dispatcher.next_challenge(&client).await, None);
        let reply = run(&dispatcher, "vault_getNodeVersion", json!([vault])).await;
        assert_eq!(
            error_code(&reply),
            i64::from(ErrorCode::HandleNotFound.value())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn challenge_queue_is_shared_by_every_spelling_of_a_client() {
        let (dispatcher, _dir) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let client: u64 = payload(
            &dispatcher,
            "getClient",
            json!([{ "authenticationDIDDocument": "{\"id\":\"did:elastos:app\"}" }]),
        )
        .await["objectId"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        payload(
            &dispatcher,
            "client_setAuthHandlerChallengeCallback",
            json!([client]),
        )
        .await;

        let create = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                run(
                    &dispatcher,
                    "client_createVault",
                    json!([client.to_string(), OWNER_DID, "https://hive.local"]),
                )
                .await
            })
        };
        let challenge = dispatcher.next_challenge(&format!(" {client}")).await;
        assert!(challenge.is_some());
        payload(
            &dispatcher,
            "client_sendAuthHandlerChallengeResponse",
            json!([client, "signed"]),
        )
        .await;
        assert_eq!(create.await.unwrap()["ok"], true);

        payload(&dispatcher, "client_close", json!([client.to_string()])).await;
        assert!(dispatcher.queues().is_empty());
        assert_eq!(dispatcher.next_challenge(&client.to_string()).await, None);
    }
}
