//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `hivebridge_core` linkage.
//! - Open one client against an in-memory local vault service.
//! - Keep output deterministic for quick local sanity checks.

use hivebridge_core::{BridgeConfig, HiveBridge, LocalBackend, ReplySink};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    println!("hivebridge_core ping={}", hivebridge_core::ping());
    println!("hivebridge_core version={}", hivebridge_core::core_version());

    match smoke_client().await {
        Ok(client) => {
            println!("hivebridge_core local_client={client}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("hivebridge_core smoke check failed: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn smoke_client() -> Result<String, String> {
    let backend = LocalBackend::open_in_memory().map_err(|err| err.to_string())?;
    let bridge = HiveBridge::new(
        Arc::new(backend),
        BridgeConfig::from_env(),
        tokio::runtime::Handle::current(),
    )
    .map_err(|err| err.to_string())?;

    let (reply, rx) = ReplySink::channel();
    bridge.get_client(
        Some(json!({ "authenticationDIDDocument": r#"{"id":"did:elastos:cli"}"# })),
        reply,
    );
    let payload = rx
        .await
        .map_err(|_| "getClient never replied".to_string())?
        .into_result()
        .map_err(|err| err.to_json().to_string())?;

    let client = payload["objectId"].as_str().unwrap_or_default().to_string();
    let (reply, rx) = ReplySink::channel();
    bridge.client_close(&client, reply);
    rx.await
        .map_err(|_| "client_close never replied".to_string())?
        .into_result()
        .map_err(|err| err.to_json().to_string())?;
    Ok(client)
}
