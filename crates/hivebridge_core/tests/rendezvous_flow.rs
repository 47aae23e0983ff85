use hivebridge_core::backend::AuthHandler;
use hivebridge_core::rendezvous::RendezvousAuthHandler;
use hivebridge_core::{
    BackendErrorKind, ChallengePhase, ChallengeRendezvous, ChallengeSink, ErrorCode, Handle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn rendezvous_with_channel(
    client: Handle,
) -> (Arc<ChallengeRendezvous>, mpsc::UnboundedReceiver<String>) {
    let rendezvous = Arc::new(ChallengeRendezvous::new());
    let (tx, rx) = mpsc::unbounded_channel();
    rendezvous.register_channel(client, ChallengeSink::from_sender(tx));
    (rendezvous, rx)
}

#[tokio::test]
async fn response_unblocks_the_suspended_login() {
    let client = Handle::from_raw(1);
    let (rendezvous, mut challenges) = rendezvous_with_channel(client);
    let handler = RendezvousAuthHandler::new(client, Arc::clone(&rendezvous), None);

    let login =
        tokio::spawn(async move { handler.authorize("jwt-challenge".to_string()).await });
    assert_eq!(challenges.recv().await.unwrap(), "jwt-challenge");
    assert_eq!(rendezvous.phase(client), ChallengePhase::ChallengeIssued);

    rendezvous.resolve(client, "signed".to_string()).unwrap();
    assert_eq!(login.await.unwrap().unwrap(), "signed");
    assert_eq!(rendezvous.phase(client), ChallengePhase::Resolved);
}

#[tokio::test]
async fn second_challenge_does_not_overwrite_the_pending_one() {
    let client = Handle::from_raw(2);
    let (rendezvous, mut challenges) = rendezvous_with_channel(client);
    let first = RendezvousAuthHandler::new(client, Arc::clone(&rendezvous), None);
    let second = RendezvousAuthHandler::new(client, Arc::clone(&rendezvous), None);

    let login = tokio::spawn(async move { first.authorize("one".to_string()).await });
    assert_eq!(challenges.recv().await.unwrap(), "one");

    let err = second.authorize("two".to_string()).await.unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::Auth);
    let err = rendezvous.issue(client, "three".to_string()).err().unwrap();
    assert_eq!(err.code, ErrorCode::ProtocolViolation);

    rendezvous.resolve(client, "for-one".to_string()).unwrap();
    assert_eq!(login.await.unwrap().unwrap(), "for-one");
}

#[tokio::test]
async fn response_without_challenge_is_a_protocol_violation() {
    let client = Handle::from_raw(3);
    let (rendezvous, _challenges) = rendezvous_with_channel(client);
    let err = rendezvous.resolve(client, "early".to_string()).unwrap_err();
    assert_eq!(err.code, ErrorCode::ProtocolViolation);

    let err = rendezvous
        .resolve(Handle::from_raw(99), "stranger".to_string())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn channel_is_reused_for_later_challenges() {
    let client = Handle::from_raw(4);
    let (rendezvous, mut challenges) = rendezvous_with_channel(client);

    for round in 0..3 {
        let handler = RendezvousAuthHandler::new(client, Arc::clone(&rendezvous), None);
        let challenge = format!("challenge-{round}");
        let login = tokio::spawn(async move { handler.authorize(challenge).await });
        let pushed = challenges.recv().await.unwrap();
        rendezvous.resolve(client, format!("{pushed}-signed")).unwrap();
        assert_eq!(
            login.await.unwrap().unwrap(),
            format!("challenge-{round}-signed")
        );
    }
}

#[tokio::test]
async fn unanswered_challenge_times_out_and_is_cleared() {
    let client = Handle::from_raw(5);
    let (rendezvous, mut challenges) = rendezvous_with_channel(client);
    let handler = RendezvousAuthHandler::new(
        client,
        Arc::clone(&rendezvous),
        Some(Duration::from_millis(20)),
    );

    let err = handler.authorize("slow".to_string()).await.unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::Auth);
    assert!(err.message.contains("timed out"));
    assert_eq!(challenges.recv().await.unwrap(), "slow");
    assert_eq!(rendezvous.phase(client), ChallengePhase::NoChallenge);

    let err = rendezvous.resolve(client, "late".to_string()).unwrap_err();
    assert_eq!(err.code, ErrorCode::ProtocolViolation);
}
