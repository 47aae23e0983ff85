//! FFI API for Flutter-facing calls.
//!
//! # Responsibility
//! - Expose the flat `action + positional JSON args` command surface to Dart via FRB.
//! - Expose the multi-shot challenge surface as register + poll functions.
//! - Own the process-wide bridge runtime.
//!
//! # Invariants
//! - Exported functions must not panic across FFI boundary.
//! - `execute` always returns one JSON envelope string.
//! - The bridge is initialized at most once per process.

use crate::dispatch::{envelope, Dispatcher};
use hivebridge_core::{
    core_version as core_version_inner, init_logging as init_logging_inner, ping as ping_inner,
    BridgeConfig, HiveBridge, LocalBackend, Reply, StructuredError,
};
use log::info;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;

struct FrontEnd {
    db_path: PathBuf,
    // Held so bridge tasks keep a live executor.
    _runtime: tokio::runtime::Runtime,
    dispatcher: Dispatcher,
}

static FRONT_END: OnceCell<FrontEnd> = OnceCell::new();

/// Minimal health-check API for FRB smoke integration.
///
/// # FFI contract
/// - Sync call, non-blocking.
/// - Never throws; always returns a UTF-8 string.
#[flutter_rust_bridge::frb(sync)]
pub fn ping() -> String {
    ping_inner().to_owned()
}

/// Expose core crate version through FFI.
#[flutter_rust_bridge::frb(sync)]
pub fn core_version() -> String {
    core_version_inner().to_owned()
}

/// Initializes Rust core logging once per process.
///
/// Input semantics:
/// - `level`: one of `trace|debug|info|warn|error` (case-insensitive).
/// - `log_dir`: absolute directory path where rolling logs are written.
///
/// # FFI contract
/// - Sync call; may perform small file-system setup work.
/// - Safe to call repeatedly with the same `level + log_dir` (idempotent).
/// - Never panics; returns empty string on success and error message on failure.
#[flutter_rust_bridge::frb(sync)]
pub fn init_logging(level: String, log_dir: String) -> String {
    match init_logging_inner(level.as_str(), log_dir.as_str()) {
        Ok(()) => String::new(),
        Err(err) => err,
    }
}

/// Opens the local vault database at `db_path` and starts the bridge.
///
/// # FFI contract
/// - Sync call; opens the database and spawns the bridge runtime.
/// - Repeating the call with the same path is a no-op; a different path is
///   rejected.
/// - Returns empty string on success and error message on failure.
#[flutter_rust_bridge::frb(sync)]
pub fn init_bridge(db_path: String) -> String {
    let requested = PathBuf::from(db_path.trim());
    if requested.as_os_str().is_empty() {
        return "db_path must not be empty".to_string();
    }
    match FRONT_END.get_or_try_init(|| start_front_end(requested.clone())) {
        Ok(front_end) if front_end.db_path == requested => String::new(),
        Ok(front_end) => format!(
            "bridge already initialized with `{}`",
            front_end.db_path.display()
        ),
        Err(err) => err,
    }
}

/// Runs one bridge command and returns its reply envelope as JSON.
///
/// `args_json` is a JSON array of positional arguments. The reply is
/// `{"ok":true,"payload":...}` or `{"ok":false,"error":{"code","message"}}`.
pub async fn execute(action: String, args_json: String) -> String {
    match FRONT_END.get() {
        Some(front_end) => front_end
            .dispatcher
            .execute_json(&action, &args_json)
            .await
            .to_string(),
        None => not_initialized().to_string(),
    }
}

/// Registers the challenge queue of `client_id`.
///
/// Returns the reply envelope of the registration itself; challenges are
/// collected with `client_next_auth_challenge`.
#[flutter_rust_bridge::frb(sync)]
pub fn client_set_auth_challenge_callback(client_id: String) -> String {
    let Some(front_end) = FRONT_END.get() else {
        return not_initialized().to_string();
    };
    let reply = match front_end.dispatcher.register_challenge_channel(&client_id) {
        Ok(()) => Reply::Success(serde_json::Value::Null),
        Err(err) => Reply::Failure(err),
    };
    envelope(reply).to_string()
}

/// Waits for the next challenge issued to `client_id`.
///
/// Returns `None` once the client is closed or was never registered.
pub async fn client_next_auth_challenge(client_id: String) -> Option<String> {
    FRONT_END
        .get()?
        .dispatcher
        .next_challenge(&client_id)
        .await
}

fn start_front_end(db_path: PathBuf) -> Result<FrontEnd, String> {
    let backend = LocalBackend::open(&db_path)
        .map_err(|err| format!("vault database open failed: {err}"))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hivebridge-worker")
        .build()
        .map_err(|err| format!("bridge runtime start failed: {err}"))?;
    let bridge = HiveBridge::new(
        Arc::new(backend),
        BridgeConfig::from_env(),
        runtime.handle().clone(),
    )
    .map_err(|err| format!("bridge config invalid: {err}"))?;
    info!(
        "event=bridge_init module=ffi status=ok db_path={}",
        db_path.display()
    );
    Ok(FrontEnd {
        db_path,
        _runtime: runtime,
        dispatcher: Dispatcher::new(bridge),
    })
}

fn not_initialized() -> serde_json::Value {
    envelope(Reply::Failure(StructuredError::invalid_argument(
        "bridge is not initialized; call init_bridge first",
    )))
}

#[cfg(test)]
mod tests {
    use super::{
        client_next_auth_challenge, client_set_auth_challenge_callback, core_version, execute,
        init_bridge, init_logging, ping,
    };
    use serde_json::Value;

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn init_logging_rejects_empty_log_dir() {
        let error = init_logging("info".to_string(), String::new());
        assert!(!error.is_empty());
    }

    #[test]
    fn init_logging_rejects_unsupported_level() {
        let error = init_logging("verbose".to_string(), "tmp/logs".to_string());
        assert!(!error.is_empty());
    }

    #[test]
    fn init_bridge_rejects_empty_path() {
        assert!(!init_bridge("  ".to_string()).is_empty());
    }

    // Single test for the process-wide bridge so no other test races its init.
    #[tokio::test]
    async fn bridge_lifecycle_through_exported_functions() {
        let reply: Value =
            serde_json::from_str(&execute("vault_getNodeVersion".into(), "[\"1\"]".into()).await)
                .unwrap();
        assert_eq!(reply["ok"], false);

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vault.sqlite3");
        let db_path = db_path.to_string_lossy().to_string();
        assert_eq!(init_bridge(db_path.clone()), "");
        assert_eq!(init_bridge(db_path), "");
        assert!(!init_bridge(dir.path().join("other.sqlite3").to_string_lossy().to_string())
            .is_empty());

        let reply: Value = serde_json::from_str(
            &execute(
                "getClient".into(),
                r#"[{"authenticationDIDDocument":"{\"id\":\"did:elastos:app\"}"}]"#.into(),
            )
            .await,
        )
        .unwrap();
        assert_eq!(reply["ok"], true, "{reply}");
        let client = reply["payload"]["objectId"].as_str().unwrap().to_string();

        let registered: Value =
            serde_json::from_str(&client_set_auth_challenge_callback(client.clone())).unwrap();
        assert_eq!(registered["ok"], true);

        let closed: Value = serde_json::from_str(
            &execute("client_close".into(), format!("[\"{client}\"]")).await,
        )
        .unwrap();
        assert_eq!(closed["ok"], true, "{closed}");
        assert_eq!(client_next_auth_challenge(client).await, None);
    }
}
