//! One-shot completion bridge.
//!
//! # Responsibility
//! - Start a backing async (or blocking) operation without stalling the caller.
//! - Deliver exactly one success or one failure reply per invocation.
//! - Normalize backing failures once, at this boundary.
//!
//! # Invariants
//! - `ReplySink` is consumed by its first delivery, so a second terminal
//!   reply cannot be expressed.
//! - Object-returning operations allocate their handle inside the projector,
//!   before the reply is sent.

use crate::error::{normalize, BackendResult, StructuredError};
use crate::logging::log_completion;
use log::debug;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::oneshot;

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Failure(StructuredError),
}

impl Reply {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Wire value of the failure code, `None` on success.
    pub fn error_code(&self) -> Option<i32> {
        match self {
            Self::Success(_) => None,
            Self::Failure(err) => Some(err.code.value()),
        }
    }

    /// Returns the success payload, or the structured error.
    pub fn into_result(self) -> Result<Value, StructuredError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
        }
    }
}

impl From<Result<Value, StructuredError>> for Reply {
    fn from(value: Result<Value, StructuredError>) -> Self {
        match value {
            Ok(payload) => Self::Success(payload),
            Err(err) => Self::Failure(err),
        }
    }
}

/// Single-use reply channel back to the caller.
pub struct ReplySink {
    deliver: Box<dyn FnOnce(Reply) + Send>,
}

impl ReplySink {
    pub fn new(deliver: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(deliver),
        }
    }

    /// Sink paired with a receiver that resolves to the reply.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self::new(move |reply| {
            if tx.send(reply).is_err() {
                debug!("event=reply_dropped module=completion status=ok reason=receiver_gone");
            }
        });
        (sink, rx)
    }

    pub fn send(self, reply: Reply) {
        (self.deliver)(reply);
    }

    pub fn success(self, payload: Value) {
        self.send(Reply::Success(payload));
    }

    pub fn failure(self, err: StructuredError) {
        self.send(Reply::Failure(err));
    }
}

/// Runs backing operations on the bridge runtime and relays their outcome.
#[derive(Clone)]
pub struct CompletionBridge {
    runtime: RuntimeHandle,
}

impl CompletionBridge {
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Awaits `operation` in the background and replies once.
    pub fn complete<T, Fut, P>(
        &self,
        action: &'static str,
        operation: Fut,
        project: P,
        reply: ReplySink,
    ) where
        T: Send + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
        P: FnOnce(T) -> Value + Send + 'static,
    {
        self.complete_with(action, operation, move |value| Reply::Success(project(value)), reply);
    }

    /// Like `complete`, but the projector decides the final reply shape.
    ///
    /// Used where a backing failure is part of the success contract
    /// (for example "vault already exists" replying a null payload).
    pub fn complete_with<T, Fut, P>(
        &self,
        action: &'static str,
        operation: Fut,
        project: P,
        reply: ReplySink,
    ) where
        T: Send + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
        P: FnOnce(T) -> Reply + Send + 'static,
    {
        let started_at = Instant::now();
        self.runtime.spawn(async move {
            let outcome = match operation.await {
                Ok(value) => project(value),
                Err(err) => Reply::Failure(normalize(&err)),
            };
            log_completion(action, started_at.elapsed(), outcome.error_code());
            reply.send(outcome);
        });
    }

    /// Runs a blocking backing call on a blocking worker and replies once.
    pub fn complete_blocking<T, F, P>(
        &self,
        action: &'static str,
        operation: F,
        project: P,
        reply: ReplySink,
    ) where
        T: Send + 'static,
        F: FnOnce() -> BackendResult<T> + Send + 'static,
        P: FnOnce(T) -> Value + Send + 'static,
    {
        let worker = self.runtime.spawn_blocking(operation);
        self.complete(
            action,
            async move {
                match worker.await {
                    Ok(result) => result,
                    Err(join_err) => Err(crate::error::BackendError::other(format!(
                        "blocking worker failed: {join_err}"
                    ))),
                }
            },
            project,
            reply,
        );
    }

    /// Replies immediately with an outcome computed on the caller path.
    pub fn reply_now(&self, action: &'static str, outcome: Reply, reply: ReplySink) {
        log_completion(action, Duration::ZERO, outcome.error_code());
        reply.send(outcome);
    }

    /// Replies immediately with a bridge-side failure (no normalization).
    pub fn reject(&self, action: &'static str, err: StructuredError, reply: ReplySink) {
        self.reply_now(action, Reply::Failure(err), reply);
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionBridge, Reply, ReplySink};
    use crate::error::{BackendError, BackendErrorKind, ErrorCode, StructuredError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn success_is_projected_once() {
        let bridge = CompletionBridge::new(tokio::runtime::Handle::current());
        let (sink, rx) = ReplySink::channel();
        bridge.complete("test_ok", async { Ok(7_u32) }, |n| json!({ "n": n }), sink);

        let reply = rx.await.expect("reply delivered");
        assert_eq!(reply, Reply::Success(json!({ "n": 7 })));
    }

    #[tokio::test]
    async fn failure_is_normalized() {
        let bridge = CompletionBridge::new(tokio::runtime::Handle::current());
        let (sink, rx) = ReplySink::channel();
        bridge.complete(
            "test_err",
            async {
                Err::<(), _>(BackendError::other("collection not exist: notes"))
            },
            |_| json!(null),
            sink,
        );

        let err = rx
            .await
            .expect("reply delivered")
            .into_result()
            .expect_err("failure expected");
        assert_eq!(err.code, ErrorCode::CollectionNotFound);
    }

    #[tokio::test]
    async fn blocking_operations_reply_through_worker() {
        let bridge = CompletionBridge::new(tokio::runtime::Handle::current());
        let (sink, rx) = ReplySink::channel();
        bridge.complete_blocking(
            "test_blocking",
            || Err::<(), _>(BackendError::new(BackendErrorKind::FileNotFound, "x")),
            |_| json!(null),
            sink,
        );
        let err = rx.await.expect("reply").into_result().expect_err("failure");
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[test]
    fn reply_sink_delivers_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sink = ReplySink::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        sink.failure(StructuredError::protocol_violation("x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
