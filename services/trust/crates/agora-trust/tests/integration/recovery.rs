//! Ownership recovery through a published challenge token.

use agora_common::{AgentId, AgentIdentity, Clock};
use agora_trust::{AgentRepository, ErrorKind, FetchError};
use axum::http::StatusCode;
use chrono::{Duration, Utc};

use crate::helpers::{
    AGENT_URL, CLIENT_IP, Harness, ScriptedFetcher, VERIFY_URL, harness, harness_with,
    test_settings,
};

async fn registered(h: &Harness) -> AgentId {
    h.registry
        .register(CLIENT_IP, AGENT_URL, "original-key")
        .await
        .unwrap()
        .id
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn published_token_rotates_owner_key() {
    let h = harness();
    let id = registered(&h).await;

    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    assert_eq!(start.verification_url, VERIFY_URL);
    assert_eq!(start.expires_at, h.clock.now() + Duration::seconds(900));
    assert_ne!(start.challenge_token, start.session_secret);

    // Stored challenge carries digests only.
    let stored = h.repo.get(id).await.unwrap().unwrap();
    let challenge = stored.recovery.unwrap();
    assert_ne!(challenge.challenge_hash, start.challenge_token);
    assert_ne!(challenge.session_fingerprint, start.session_secret);

    h.fetcher
        .respond(VERIFY_URL, 200, &format!("{}\n", start.challenge_token));
    h.registry
        .complete_recovery(CLIENT_IP, id, "rotated-key", &start.session_secret)
        .await
        .unwrap();

    assert_eq!(h.fetcher.calls(), vec![VERIFY_URL.to_string()]);
    h.registry.authenticate_owner(id, "rotated-key").await.unwrap();
    let err = h
        .registry
        .authenticate_owner(id, "original-key")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredential);

    let stored = h.repo.get(id).await.unwrap().unwrap();
    assert!(stored.recovery.is_none());
    assert!(stored.consumed_recovery_session.is_some());
}

// ── Challenge lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn new_challenge_supersedes_the_previous_one() {
    let h = harness();
    let id = registered(&h).await;

    let first = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    let second = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    assert_ne!(first.challenge_token, second.challenge_token);

    h.fetcher.respond(VERIFY_URL, 200, &first.challenge_token);
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &first.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionMismatch);

    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &second.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeVerificationMismatch);
}

#[tokio::test]
async fn expired_challenge_is_rejected_without_fetching() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);

    h.clock.advance(Duration::seconds(901));
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveOrExpiredChallenge);
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn challenge_expires_at_the_expiry_instant() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);

    h.clock.set(start.expires_at);
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveOrExpiredChallenge);

    h.clock.set(start.expires_at - Duration::seconds(1));
    h.registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap();
}

#[tokio::test]
async fn complete_without_challenge_is_rejected() {
    let h = harness();
    let id = registered(&h).await;
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", "no-session")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveOrExpiredChallenge);
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let h = harness();
    let err = h
        .registry
        .start_recovery(CLIENT_IP, AgentId::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}

// ── Verification failures ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_session_is_rejected_before_fetching() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);

    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", "someone-elses-session")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionMismatch);
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn mismatched_token_is_rejected_and_key_kept() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, "not-the-token");

    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeVerificationMismatch);
    h.registry.authenticate_owner(id, "original-key").await.unwrap();

    // The challenge survives a failed attempt.
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);
    h.registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap();
}

#[tokio::test]
async fn non_success_status_is_unreachable() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 404, &start.challenge_token);

    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VerificationUnreachable);
}

#[tokio::test]
async fn transport_failure_is_unreachable() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.fail(VERIFY_URL, FetchError::Timeout);

    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VerificationUnreachable);
}

#[tokio::test]
async fn private_verification_target_is_never_fetched() {
    let h = harness();
    let identity = AgentIdentity::new(
        "https://internal.example.com/a2a".to_string(),
        "0".repeat(64),
        Utc::now(),
    );
    let id = identity.id;
    h.repo.insert(identity).await.unwrap();

    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeTarget);
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn empty_new_key_is_rejected() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, " ", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredential);
}

// ── Single use ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn replayed_completion_is_a_conflict() {
    let h = harness();
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);

    h.registry
        .complete_recovery(CLIENT_IP, id, "k2", &start.session_secret)
        .await
        .unwrap();
    let err = h
        .registry
        .complete_recovery(CLIENT_IP, id, "k3", &start.session_secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeAlreadyConsumed);
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
    h.registry.authenticate_owner(id, "k2").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_completions_rotate_exactly_once() {
    let h = harness_with(test_settings(), ScriptedFetcher::with_barrier(2));
    let id = registered(&h).await;
    let start = h.registry.start_recovery(CLIENT_IP, id).await.unwrap();
    h.fetcher.respond(VERIFY_URL, 200, &start.challenge_token);

    let (a, b) = tokio::join!(
        h.registry
            .complete_recovery(CLIENT_IP, id, "key-a", &start.session_secret),
        h.registry
            .complete_recovery(CLIENT_IP, id, "key-b", &start.session_secret),
    );

    // Both passed verification; the conditional write admits one.
    assert_eq!(h.fetcher.calls().len(), 2);
    let results = [a, b];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::ChallengeAlreadyConsumed);

    let a_ok = h.registry.authenticate_owner(id, "key-a").await.is_ok();
    let b_ok = h.registry.authenticate_owner(id, "key-b").await.is_ok();
    assert!(a_ok ^ b_ok);
}

// ── Rate limits ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn recovery_attempts_are_throttled_per_agent() {
    let h = harness();
    let id = registered(&h).await;
    for i in 0..5 {
        h.registry
            .start_recovery(&format!("198.51.100.{i}"), id)
            .await
            .unwrap();
    }
    let err = h
        .registry
        .start_recovery("198.51.100.99", id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert!(err.retry_after_seconds().is_some());
}
