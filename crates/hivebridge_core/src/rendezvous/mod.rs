//! Challenge/response rendezvous for client authentication.
//!
//! # Responsibility
//! - Keep one multi-shot challenge channel per client handle.
//! - Park the backing login on a pending completion until the caller answers
//!   the challenge through an unrelated, later call.
//!
//! # Invariants
//! - Per client: `NoChallenge -> ChallengeIssued -> Resolved`, and
//!   `Resolved -> ChallengeIssued` for a later re-authentication.
//! - At most one pending completion per client; a second challenge while one
//!   is pending is rejected, never overwritten.
//! - A response without a pending challenge is rejected.
//! - Challenge tokens are never logged.

use crate::backend::AuthHandler;
use crate::error::{BackendError, BackendErrorKind, BackendResult, StructuredError};
use crate::handle::Handle;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Multi-shot channel that delivers challenges to the caller.
///
/// Pushing never terminates the channel.
#[derive(Clone)]
pub struct ChallengeSink {
    push: Arc<dyn Fn(String) -> bool + Send + Sync>,
}

impl ChallengeSink {
    /// `push` returns `false` when the caller side is gone.
    pub fn new(push: impl Fn(String) -> bool + Send + Sync + 'static) -> Self {
        Self {
            push: Arc::new(push),
        }
    }

    pub fn from_sender(sender: mpsc::UnboundedSender<String>) -> Self {
        Self::new(move |challenge| sender.send(challenge).is_ok())
    }

    pub fn push(&self, challenge: String) -> bool {
        (self.push)(challenge)
    }
}

/// Authentication phase of one client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    NoChallenge,
    ChallengeIssued,
    Resolved,
}

impl ChallengePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoChallenge => "no_challenge",
            Self::ChallengeIssued => "challenge_issued",
            Self::Resolved => "resolved",
        }
    }
}

struct ClientAuthState {
    channel: Option<ChallengeSink>,
    pending: Option<oneshot::Sender<String>>,
    phase: ChallengePhase,
}

impl Default for ClientAuthState {
    fn default() -> Self {
        Self {
            channel: None,
            pending: None,
            phase: ChallengePhase::NoChallenge,
        }
    }
}

/// Suspended login waiting for the caller's response.
pub struct PendingChallenge {
    client: Handle,
    receiver: oneshot::Receiver<String>,
}

impl PendingChallenge {
    pub fn client(&self) -> Handle {
        self.client
    }

    /// Resolves with the response, or `None` when the challenge was cancelled.
    pub async fn wait(self) -> Option<String> {
        self.receiver.await.ok()
    }
}

/// Pending-completion table keyed by client handle.
#[derive(Default)]
pub struct ChallengeRendezvous {
    clients: Mutex<HashMap<Handle, ClientAuthState>>,
}

impl ChallengeRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates the caller's multi-shot channel with `client`.
    ///
    /// Re-registering replaces the previous channel; a pending challenge is
    /// kept.
    pub fn register_channel(&self, client: Handle, channel: ChallengeSink) {
        let mut clients = self.lock();
        clients.entry(client).or_default().channel = Some(channel);
        info!(
            "event=challenge_channel module=rendezvous status=ok client={}",
            client
        );
    }

    /// Opens a pending completion for `client` and pushes `challenge` to the
    /// registered channel.
    pub fn issue(
        &self,
        client: Handle,
        challenge: String,
    ) -> Result<PendingChallenge, StructuredError> {
        let (sender, receiver) = oneshot::channel();
        let (channel, previous_phase) = {
            let mut clients = self.lock();
            let Some((state, channel)) = clients
                .get_mut(&client)
                .and_then(|state| state.channel.clone().map(|channel| (state, channel)))
            else {
                return Err(StructuredError::protocol_violation(format!(
                    "no challenge channel registered for client `{client}`"
                )));
            };
            if state.pending.is_some() {
                return Err(StructuredError::protocol_violation(format!(
                    "client `{client}` already has a pending challenge"
                )));
            }
            let previous_phase = state.phase;
            state.pending = Some(sender);
            state.phase = ChallengePhase::ChallengeIssued;
            (channel, previous_phase)
        };

        // Pushed outside the lock: the channel may call back into the bridge.
        if !channel.push(challenge) {
            let mut clients = self.lock();
            if let Some(state) = clients.get_mut(&client) {
                state.pending = None;
                state.phase = previous_phase;
            }
            warn!(
                "event=challenge_issue module=rendezvous status=error client={} error_code=channel_closed",
                client
            );
            return Err(StructuredError::protocol_violation(format!(
                "challenge channel for client `{client}` is closed"
            )));
        }

        info!(
            "event=challenge_issue module=rendezvous status=ok client={}",
            client
        );
        Ok(PendingChallenge { client, receiver })
    }

    /// Completes the pending challenge of `client` with `response`.
    pub fn resolve(&self, client: Handle, response: String) -> Result<(), StructuredError> {
        let sender = {
            let mut clients = self.lock();
            let Some(state) = clients.get_mut(&client) else {
                return Err(no_pending_challenge(client));
            };
            let Some(sender) = state.pending.take() else {
                return Err(no_pending_challenge(client));
            };
            state.phase = ChallengePhase::Resolved;
            sender
        };

        if sender.send(response).is_err() {
            warn!(
                "event=challenge_resolve module=rendezvous status=error client={} error_code=login_abandoned",
                client
            );
            return Err(StructuredError::protocol_violation(format!(
                "login for client `{client}` is no longer waiting for a response"
            )));
        }
        info!(
            "event=challenge_resolve module=rendezvous status=ok client={}",
            client
        );
        Ok(())
    }

    /// Drops the pending challenge of `client`, failing the suspended login.
    pub fn cancel(&self, client: Handle) -> bool {
        let mut clients = self.lock();
        let Some(state) = clients.get_mut(&client) else {
            return false;
        };
        let cancelled = state.pending.take().is_some();
        if cancelled {
            state.phase = ChallengePhase::NoChallenge;
            info!(
                "event=challenge_cancel module=rendezvous status=ok client={}",
                client
            );
        }
        cancelled
    }

    /// Forgets `client` entirely (session teardown).
    pub fn remove(&self, client: Handle) {
        self.lock().remove(&client);
    }

    pub fn phase(&self, client: Handle) -> ChallengePhase {
        self.lock()
            .get(&client)
            .map_or(ChallengePhase::NoChallenge, |state| state.phase)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, ClientAuthState>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn no_pending_challenge(client: Handle) -> StructuredError {
    StructuredError::protocol_violation(format!("no pending challenge for client `{client}`"))
}

/// `AuthHandler` that routes backing challenges through the rendezvous.
pub struct RendezvousAuthHandler {
    client: Handle,
    rendezvous: Arc<ChallengeRendezvous>,
    timeout: Option<Duration>,
}

impl RendezvousAuthHandler {
    pub fn new(
        client: Handle,
        rendezvous: Arc<ChallengeRendezvous>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            rendezvous,
            timeout,
        }
    }
}

#[async_trait]
impl AuthHandler for RendezvousAuthHandler {
    async fn authorize(&self, challenge: String) -> BackendResult<String> {
        let pending = self
            .rendezvous
            .issue(self.client, challenge)
            .map_err(|err| BackendError::new(BackendErrorKind::Auth, err.message))?;

        let response = match self.timeout {
            None => pending.wait().await,
            Some(limit) => match tokio::time::timeout(limit, pending.wait()).await {
                Ok(response) => response,
                Err(_) => {
                    self.rendezvous.cancel(self.client);
                    warn!(
                        "event=challenge_timeout module=rendezvous status=error client={} timeout_ms={}",
                        self.client,
                        limit.as_millis()
                    );
                    return Err(BackendError::new(
                        BackendErrorKind::Auth,
                        "challenge response timed out",
                    ));
                }
            },
        };

        response.ok_or_else(|| {
            BackendError::new(BackendErrorKind::Auth, "challenge was cancelled")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ChallengePhase, ChallengeRendezvous, ChallengeSink};
    use crate::error::ErrorCode;
    use crate::handle::Handle;
    use tokio::sync::mpsc;

    #[test]
    fn issue_without_channel_is_a_protocol_violation() {
        let rendezvous = ChallengeRendezvous::new();
        let err = rendezvous
            .issue(Handle::from_raw(1), "jwt".to_string())
            .err()
            .expect("no channel registered");
        assert_eq!(err.code, ErrorCode::ProtocolViolation);
        assert_eq!(
            rendezvous.phase(Handle::from_raw(1)),
            ChallengePhase::NoChallenge
        );
    }

    #[test]
    fn refused_issues_leave_no_client_state_behind() {
        let rendezvous = ChallengeRendezvous::new();
        for raw in 1..=64 {
            assert!(rendezvous
                .issue(Handle::from_raw(raw), "jwt".to_string())
                .is_err());
        }
        assert!(rendezvous.lock().is_empty());
    }

    #[test]
    fn closed_channel_rolls_back_pending_state() {
        let rendezvous = ChallengeRendezvous::new();
        let client = Handle::from_raw(3);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        rendezvous.register_channel(client, ChallengeSink::from_sender(tx));

        let err = rendezvous
            .issue(client, "jwt".to_string())
            .err()
            .expect("closed channel");
        assert_eq!(err.code, ErrorCode::ProtocolViolation);
        assert_eq!(rendezvous.phase(client), ChallengePhase::NoChallenge);
        assert!(rendezvous.resolve(client, "x".to_string()).is_err());
    }

    #[tokio::test]
    async fn cancel_fails_the_waiting_login() {
        let rendezvous = ChallengeRendezvous::new();
        let client = Handle::from_raw(9);
        let (tx, _rx) = mpsc::unbounded_channel();
        rendezvous.register_channel(client, ChallengeSink::from_sender(tx));

        let pending = rendezvous
            .issue(client, "jwt".to_string())
            .ok()
            .expect("issue succeeds");
        assert!(rendezvous.cancel(client));
        assert_eq!(pending.wait().await, None);
        assert!(!rendezvous.cancel(client));
    }
}
