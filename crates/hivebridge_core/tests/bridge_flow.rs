use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hivebridge_core::{
    BridgeConfig, ChallengePhase, ChallengeSink, ErrorCode, Handle, HiveBridge, LocalBackend,
    Reply, ReplySink,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

const OWNER_DID: &str = "did:elastos:owner";
const PROVIDER: &str = "https://hive.local";

struct Fixture {
    bridge: HiveBridge,
    _cache: TempDir,
}

fn fixture() -> Fixture {
    let cache = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        did_cache_dir: cache.path().join("didCache"),
        ..BridgeConfig::default()
    };
    let backend = Arc::new(LocalBackend::open_in_memory().unwrap());
    let bridge = HiveBridge::new(backend, config, tokio::runtime::Handle::current()).unwrap();
    Fixture {
        bridge,
        _cache: cache,
    }
}

async fn call(start: impl FnOnce(ReplySink)) -> Reply {
    let (sink, rx) = ReplySink::channel();
    start(sink);
    rx.await.unwrap()
}

async fn ok(start: impl FnOnce(ReplySink)) -> Value {
    call(start).await.into_result().unwrap()
}

async fn failure_code(start: impl FnOnce(ReplySink)) -> ErrorCode {
    call(start).await.into_result().unwrap_err().code
}

fn object_id(payload: &Value) -> String {
    payload["objectId"].as_str().unwrap().to_string()
}

fn client_options() -> Value {
    json!({ "authenticationDIDDocument": r#"{"id":"did:elastos:app"}"# })
}

/// Opens a client with a registered challenge channel.
async fn open_client(bridge: &HiveBridge) -> (String, mpsc::UnboundedReceiver<String>) {
    let client = object_id(&ok(|reply| bridge.get_client(Some(client_options()), reply)).await);
    let (tx, rx) = mpsc::unbounded_channel();
    bridge
        .client_set_auth_challenge_channel(&client, ChallengeSink::from_sender(tx))
        .unwrap();
    (client, rx)
}

/// Creates the owner's vault, answering the login challenge on the way.
async fn open_vault(bridge: &HiveBridge) -> (String, String) {
    let (client, mut challenges) = open_client(bridge).await;
    let (sink, created) = ReplySink::channel();
    bridge.client_create_vault(
        &client,
        Some(OWNER_DID.to_string()),
        Some(PROVIDER.to_string()),
        sink,
    );

    let challenge = challenges.recv().await.unwrap();
    assert!(challenge.starts_with("hive-auth-challenge:did:elastos:app:"));
    ok(|reply| {
        bridge.client_send_auth_challenge_response(&client, Some("signed-jwt".to_string()), reply)
    })
    .await;

    let vault = created.await.unwrap().into_result().unwrap();
    assert_eq!(vault["vaultOwnerDid"], OWNER_DID);
    assert_eq!(vault["vaultProviderAddress"], PROVIDER);
    (client, object_id(&vault))
}

#[tokio::test]
async fn login_challenge_resolves_exactly_once() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (client, _vault) = open_vault(bridge).await;
    let handle: Handle = client.parse().unwrap();
    assert_eq!(bridge.rendezvous().phase(handle), ChallengePhase::Resolved);

    // A second response has no pending challenge to complete.
    let code = failure_code(|reply| {
        bridge.client_send_auth_challenge_response(&client, Some("again".to_string()), reply)
    })
    .await;
    assert_eq!(code, ErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn get_client_requires_options() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    assert_eq!(
        failure_code(|reply| bridge.get_client(None, reply)).await,
        ErrorCode::InvalidArgument
    );
    assert_eq!(
        failure_code(|reply| bridge.get_client(Some(json!({ "other": 1 })), reply)).await,
        ErrorCode::InvalidArgument
    );
}

#[tokio::test]
async fn unknown_handles_are_reported() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    assert_eq!(
        failure_code(|reply| bridge.vault_get_node_version("not-a-handle", reply)).await,
        ErrorCode::HandleNotFound
    );
    assert_eq!(
        failure_code(|reply| bridge.reader_read_all("42", reply)).await,
        ErrorCode::HandleNotFound
    );
    assert!(bridge
        .client_set_auth_challenge_channel("7", ChallengeSink::new(|_| true))
        .is_err());
}

#[tokio::test]
async fn existing_vault_replies_null_and_missing_vault_is_normalized() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (client, _vault) = open_vault(bridge).await;

    let again = ok(|reply| {
        bridge.client_create_vault(
            &client,
            Some(OWNER_DID.to_string()),
            Some(PROVIDER.to_string()),
            reply,
        )
    })
    .await;
    assert_eq!(again, Value::Null);

    let not_set = ok(|reply| {
        bridge.client_create_vault(
            &client,
            Some("did:elastos:other".to_string()),
            Some(String::new()),
            reply,
        )
    })
    .await;
    assert_eq!(not_set, Value::Null);

    let err = call(|reply| {
        bridge.client_get_vault(&client, Some("did:elastos:nobody".to_string()), reply)
    })
    .await
    .into_result()
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::VaultNotFound);
    assert!(err.message.contains("createVault()"));

    let reopened = ok(|reply| bridge.client_get_vault(&client, Some(OWNER_DID.to_string()), reply))
        .await;
    assert_eq!(reopened["vaultOwnerDid"], OWNER_DID);
}

#[tokio::test]
async fn database_round_trip_through_bridge() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (_client, vault) = open_vault(bridge).await;

    let code = failure_code(|reply| {
        bridge.database_insert_one(&vault, "notes".to_string(), Some(json!({ "a": 1 })), reply)
    })
    .await;
    assert_eq!(code, ErrorCode::CollectionNotFound);

    let created =
        ok(|reply| bridge.database_create_collection(&vault, "notes".to_string(), reply)).await;
    assert_eq!(created, json!({ "created": true }));

    let inserted = ok(|reply| {
        bridge.database_insert_many(
            &vault,
            "notes".to_string(),
            Some(vec![
                json!({ "title": "a", "rank": 2 }),
                json!({ "title": "b", "rank": 1 }),
                json!({ "title": "c", "rank": 3 }),
            ]),
            reply,
        )
    })
    .await;
    assert_eq!(inserted["insertedIds"].as_array().unwrap().len(), 3);

    let count = ok(|reply| {
        bridge.database_count_documents(&vault, "notes".to_string(), None, reply)
    })
    .await;
    assert_eq!(count, json!({ "count": 3 }));

    let sorted = ok(|reply| {
        bridge.database_find_many(
            &vault,
            "notes".to_string(),
            None,
            Some(json!({ "sort": { "rank": -1 }, "limit": 2 })),
            reply,
        )
    })
    .await;
    let titles = sorted
        .as_array()
        .unwrap()
        .iter()
        .map(|doc| doc["title"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["c", "a"]);

    let updated = ok(|reply| {
        bridge.database_update(
            &vault,
            "notes".to_string(),
            Some(json!({ "title": "b" })),
            Some(json!({ "$set": { "rank": 10 } })),
            true,
            reply,
        )
    })
    .await;
    assert_eq!(updated["matchedCount"], 1);
    assert_eq!(updated["modifiedCount"], 1);

    let found = ok(|reply| {
        bridge.database_find_one(
            &vault,
            "notes".to_string(),
            Some(json!({ "title": "b" })),
            None,
            reply,
        )
    })
    .await;
    assert_eq!(found["rank"], 10);

    let missing = ok(|reply| {
        bridge.database_find_one(
            &vault,
            "notes".to_string(),
            Some(json!({ "title": "zzz" })),
            None,
            reply,
        )
    })
    .await;
    assert_eq!(missing, Value::Null);

    let deleted = ok(|reply| {
        bridge.database_delete(&vault, "notes".to_string(), None, false, reply)
    })
    .await;
    assert_eq!(deleted, json!({ "deletedCount": 3 }));
}

#[tokio::test]
async fn writer_session_then_write_after_close_is_rejected() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (_client, vault) = open_vault(bridge).await;

    let writer = object_id(&ok(|reply| bridge.files_upload(&vault, "docs/a.txt".to_string(), reply)).await);
    ok(|reply| bridge.writer_write(&writer, b"ab".to_vec(), reply)).await;
    ok(|reply| bridge.writer_write(&writer, b"cd".to_vec(), reply)).await;
    ok(|reply| bridge.writer_flush(&writer, reply)).await;
    ok(|reply| bridge.writer_close(&writer, reply)).await;
    assert_eq!(
        failure_code(|reply| bridge.writer_write(&writer, b"x".to_vec(), reply)).await,
        ErrorCode::HandleNotFound
    );

    let reader =
        object_id(&ok(|reply| bridge.files_download(&vault, "docs/a.txt".to_string(), reply)).await);
    let first = ok(|reply| bridge.reader_read(&reader, 3, reply)).await;
    assert_eq!(first, Value::String(STANDARD.encode(b"abc")));
    let rest = ok(|reply| bridge.reader_read_all(&reader, reply)).await;
    assert_eq!(rest, Value::String(STANDARD.encode(b"d")));
    let end = ok(|reply| bridge.reader_read(&reader, 3, reply)).await;
    assert_eq!(end, Value::Null);
    ok(|reply| bridge.reader_close(&reader, reply)).await;
    assert_eq!(
        failure_code(|reply| bridge.reader_close(&reader, reply)).await,
        ErrorCode::HandleNotFound
    );

    let hash = ok(|reply| bridge.files_hash(&vault, "docs/a.txt".to_string(), reply)).await;
    assert_eq!(
        hash,
        "88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589"
    );
    let stat = ok(|reply| bridge.files_stat(&vault, "docs/a.txt".to_string(), reply)).await;
    assert_eq!(stat["size"], 4);
    assert_eq!(stat["type"], 0);
}

#[tokio::test]
async fn files_delete_of_missing_path_reports_unsuccessful() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (_client, vault) = open_vault(bridge).await;

    let deleted = ok(|reply| bridge.files_delete(&vault, "nope.txt".to_string(), reply)).await;
    assert_eq!(deleted, json!({ "success": false }));

    let code =
        failure_code(|reply| bridge.files_download(&vault, "nope.txt".to_string(), reply)).await;
    assert_eq!(code, ErrorCode::FileNotFound);
}

#[tokio::test]
async fn client_close_releases_owned_objects() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (client, vault) = open_vault(bridge).await;
    let reader_payload = {
        let writer =
            object_id(&ok(|reply| bridge.files_upload(&vault, "x.bin".to_string(), reply)).await);
        ok(|reply| bridge.writer_close(&writer, reply)).await;
        ok(|reply| bridge.files_download(&vault, "x.bin".to_string(), reply)).await
    };
    let reader = object_id(&reader_payload);

    ok(|reply| bridge.client_close(&client, reply)).await;
    assert!(bridge.registry().is_empty());
    assert_eq!(
        failure_code(|reply| bridge.vault_get_node_version(&vault, reply)).await,
        ErrorCode::HandleNotFound
    );
    assert_eq!(
        failure_code(|reply| bridge.reader_read_all(&reader, reply)).await,
        ErrorCode::HandleNotFound
    );
    assert_eq!(
        failure_code(|reply| bridge.client_close(&client, reply)).await,
        ErrorCode::HandleNotFound
    );
}

#[tokio::test]
async fn scripting_and_payment_flow() {
    let fixture = fixture();
    let bridge = &fixture.bridge;
    let (_client, vault) = open_vault(bridge).await;

    ok(|reply| bridge.database_create_collection(&vault, "messages".to_string(), reply)).await;
    let set = ok(|reply| {
        bridge.scripting_set_script(
            &vault,
            "post".to_string(),
            Some(json!({
                "name": "post",
                "type": "insert",
                "body": { "collection": "messages", "document": { "text": "$params.text" } }
            })),
            None,
            false,
            false,
            reply,
        )
    })
    .await;
    assert_eq!(set, json!({ "success": true }));

    let called = ok(|reply| {
        bridge.scripting_call(
            &vault,
            "post".to_string(),
            Some(json!({ "text": "hello" })),
            None,
            None,
            reply,
        )
    })
    .await;
    assert!(called["post"]["inserted_id"].is_string());
    let stored = ok(|reply| {
        bridge.database_find_one(
            &vault,
            "messages".to_string(),
            Some(json!({ "text": "hello" })),
            None,
            reply,
        )
    })
    .await;
    assert_eq!(stored["text"], "hello");

    let version = ok(|reply| bridge.payment_get_payment_version(&vault, reply)).await;
    assert_eq!(version, "1.0");
    let order_id = ok(|reply| bridge.payment_place_order(&vault, "Rookie".to_string(), reply)).await;
    let order_id = order_id.as_str().unwrap().to_string();
    let paid = ok(|reply| {
        bridge.payment_pay_order(&vault, order_id.clone(), vec!["tx-1".to_string()], reply)
    })
    .await;
    assert_eq!(paid, json!({ "success": true }));
    let order = ok(|reply| bridge.payment_get_order(&vault, order_id.clone(), reply)).await;
    assert_eq!(order["status"], "paid");
    let active = ok(|reply| bridge.payment_get_active_pricing_plan(&vault, reply)).await;
    assert_eq!(active["name"], "Rookie");
    let orders = ok(|reply| bridge.payment_get_all_orders(&vault, reply)).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
}
