//! Health probing of recently queried agents.

use std::time::Duration as StdDuration;

use agora_common::{AgentIdentity, HealthStatus, ProbeOutcome};
use agora_trust::{AgentRepository, FetchError};
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::helpers::{AGENT_URL, CARD_URL, CLIENT_IP, Harness, agent_card_json, harness};

const ROOT_URL: &str = "https://agent.example.com/";

async fn queried_agent(h: &Harness) -> AgentIdentity {
    let identity = h
        .registry
        .register(CLIENT_IP, AGENT_URL, "owner-key")
        .await
        .unwrap();
    h.registry.note_queried(&[identity.id]);
    identity
}

// ── Single agent ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_card_at_well_known_path_is_healthy() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.fetcher.respond(CARD_URL, 200, &agent_card_json());

    let summary = h
        .registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.checked_count, 1);
    assert_eq!(summary.healthy_count, 1);
    assert_eq!(h.fetcher.calls(), vec![CARD_URL.to_string()]);

    let stored = h.repo.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.health.status, HealthStatus::Healthy);
    assert_eq!(stored.health.last_known_good_at, stored.health.last_probe_at);
}

#[tokio::test]
async fn falls_back_to_agent_url_then_origin() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.fetcher.respond(CARD_URL, 404, "");
    h.fetcher.respond(AGENT_URL, 200, "<html>not a card</html>");
    h.fetcher.respond(ROOT_URL, 200, &agent_card_json());

    let outcome = h.registry.prober().probe_agent(&agent).await;
    assert_eq!(outcome, ProbeOutcome::Success);
    assert_eq!(
        h.fetcher.calls(),
        vec![
            CARD_URL.to_string(),
            AGENT_URL.to_string(),
            ROOT_URL.to_string()
        ]
    );
}

#[tokio::test]
async fn card_missing_required_fields_is_a_failure() {
    let h = harness();
    let agent = queried_agent(&h).await;
    let card = serde_json::json!({"protocolVersion": "0.3.0", "name": "x", "url": AGENT_URL});
    for url in [CARD_URL, AGENT_URL, ROOT_URL] {
        h.fetcher.respond(url, 200, &card.to_string());
    }
    assert_eq!(
        h.registry.prober().probe_agent(&agent).await,
        ProbeOutcome::Failure
    );
}

#[tokio::test]
async fn failed_cycle_keeps_last_known_good() {
    let h = harness();
    let agent = queried_agent(&h).await;
    let prober = h.registry.prober();
    let cancel = CancellationToken::new();

    h.fetcher.respond(CARD_URL, 200, &agent_card_json());
    prober.run_cycle(&cancel).await.unwrap();
    let good_at = h
        .repo
        .get(agent.id)
        .await
        .unwrap()
        .unwrap()
        .health
        .last_known_good_at
        .unwrap();

    h.clock.advance(Duration::hours(1));
    h.fetcher.fail(CARD_URL, FetchError::Timeout);
    let summary = prober.run_cycle(&cancel).await.unwrap();
    assert_eq!(summary.unhealthy_count, 1);

    let stored = h.repo.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.health.status, HealthStatus::Unhealthy);
    assert_eq!(stored.health.last_known_good_at, Some(good_at));
    assert!(stored.health.last_probe_at.unwrap() > good_at);
}

#[tokio::test]
async fn private_agent_is_never_fetched() {
    let h = harness();
    let identity = AgentIdentity::new(
        "https://internal.example.com/a2a".to_string(),
        "0".repeat(64),
        Utc::now(),
    );
    h.repo.insert(identity.clone()).await.unwrap();

    assert_eq!(
        h.registry.prober().probe_agent(&identity).await,
        ProbeOutcome::Failure
    );
    assert!(h.fetcher.calls().is_empty());
}

// ── Candidate selection ──────────────────────────────────────────────────────

#[tokio::test]
async fn only_recently_queried_agents_are_probed() {
    let h = harness();
    let queried = queried_agent(&h).await;
    let ignored = h
        .registry
        .register(CLIENT_IP, "https://other.example.com/a2a", "k2")
        .await
        .unwrap();
    h.fetcher.respond(CARD_URL, 200, &agent_card_json());

    let summary = h
        .registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.checked_count, 1);
    assert_eq!(
        h.repo.get(queried.id).await.unwrap().unwrap().health.status,
        HealthStatus::Healthy
    );
    assert_eq!(
        h.repo.get(ignored.id).await.unwrap().unwrap().health.status,
        HealthStatus::Unknown
    );
}

#[tokio::test]
async fn queries_outside_lookback_window_are_ignored() {
    let h = harness();
    queried_agent(&h).await;
    h.clock.advance(Duration::hours(25));

    let summary = h
        .registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.checked_count, 0);
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn deleted_agent_is_skipped() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.repo.remove(agent.id);

    let summary = h
        .registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.checked_count, 0);
    assert_eq!(summary.skipped_count, 1);
}

// ── Staleness ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn never_healthy_agent_goes_stale_after_threshold() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let stored = h.repo.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.health.status, HealthStatus::Unhealthy);
    assert!(!h.registry.staleness(&stored).is_stale);

    h.clock.advance(Duration::days(9));
    let staleness = h.registry.staleness(&stored);
    assert!(staleness.is_stale);
    assert_eq!(staleness.stale_days, 9);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_cycle_leaves_records_untouched() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.fetcher.respond(CARD_URL, 200, &agent_card_json());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = h.registry.prober().run_cycle(&cancel).await.unwrap();
    assert_eq!(summary.checked_count, 0);
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(
        h.repo.get(agent.id).await.unwrap().unwrap().health.status,
        HealthStatus::Unknown
    );
}

#[tokio::test]
async fn probe_loop_runs_first_cycle_and_stops_on_cancel() {
    let h = harness();
    let agent = queried_agent(&h).await;
    h.fetcher.respond(CARD_URL, 200, &agent_card_json());

    let cancel = CancellationToken::new();
    let handle = h.registry.spawn_probe_loop(cancel.clone());

    // The first cycle runs without waiting for the interval.
    let mut status = HealthStatus::Unknown;
    for _ in 0..200 {
        status = h.repo.get(agent.id).await.unwrap().unwrap().health.status;
        if status != HealthStatus::Unknown {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(status, HealthStatus::Healthy);

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("probe loop did not stop")
        .unwrap();
}
