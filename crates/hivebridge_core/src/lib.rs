//! Bridge core for exposing an asynchronous vault service to flat,
//! handle-addressed callers.
//!
//! The core owns caller-visible object identity (handles), one-shot reply
//! delivery, the login challenge rendezvous and error normalization. Vault
//! semantics live behind the `backend` contracts.

pub mod backend;
pub mod bridge;
pub mod completion;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod rendezvous;
pub mod stream;

pub use backend::local::LocalBackend;
pub use bridge::HiveBridge;
pub use completion::{CompletionBridge, Reply, ReplySink};
pub use config::{BridgeConfig, ConfigError};
pub use error::{
    normalize, BackendError, BackendErrorKind, BackendResult, ErrorCode, StructuredError,
};
pub use handle::{Handle, HandleKind, HandleObject, HandleRegistry, OwnerReleased};
pub use logging::{default_log_level, init_logging, logging_status};
pub use rendezvous::{ChallengePhase, ChallengeRendezvous, ChallengeSink};
pub use stream::{ReadChunk, StreamSessions};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
