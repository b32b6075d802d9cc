//! Probe and recovery over real HTTP, with the hostname pinned to a local
//! mock server through the fetcher's resolver.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use agora_common::{HealthStatus, ManualClock, ProbeOutcome, Settings};
use agora_trust::{
    AgentRepository, MemoryRateLimiter, MemoryRepository, PinnedHttpFetcher, Registry,
    RegistryDeps, StaticResolver,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{CLIENT_IP, agent_card_json, test_settings};

const HOST: &str = "agent.test";

struct Live {
    server: MockServer,
    registry: Registry,
    repo: Arc<MemoryRepository>,
}

impl Live {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let settings = Settings {
            allow_private_network_targets: true,
            ..test_settings()
        };
        let repo = Arc::new(MemoryRepository::new());
        let registry = Registry::new(
            settings,
            RegistryDeps {
                repository: repo.clone(),
                resolver: Arc::new(
                    StaticResolver::new().with_host(HOST, &[IpAddr::V4(Ipv4Addr::LOCALHOST)]),
                ),
                fetcher: Arc::new(PinnedHttpFetcher::new(
                    Duration::from_secs(5),
                    Duration::from_secs(2),
                    64 * 1024,
                )),
                limiter: Arc::new(MemoryRateLimiter::new()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            },
        )
        .unwrap();
        Self {
            server,
            registry,
            repo,
        }
    }

    fn agent_url(&self) -> String {
        format!("http://{HOST}:{}/a2a", self.server.address().port())
    }
}

#[tokio::test]
async fn probe_reaches_pinned_host() {
    let live = Live::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/agent-card.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(agent_card_json()))
        .expect(1)
        .mount(&live.server)
        .await;

    let agent = live
        .registry
        .register(CLIENT_IP, &live.agent_url(), "owner-key")
        .await
        .unwrap();
    live.registry.note_queried(&[agent.id]);

    let summary = live
        .registry
        .prober()
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.healthy_count, 1);
    assert_eq!(
        live.repo.get(agent.id).await.unwrap().unwrap().health.status,
        HealthStatus::Healthy
    );
}

#[tokio::test]
async fn redirects_are_not_followed() {
    let live = Live::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/agent-card.json"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/card"))
        .mount(&live.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/card"))
        .respond_with(ResponseTemplate::new(200).set_body_string(agent_card_json()))
        .expect(0)
        .mount(&live.server)
        .await;

    let agent = live
        .registry
        .register(CLIENT_IP, &live.agent_url(), "owner-key")
        .await
        .unwrap();
    assert_eq!(
        live.registry.prober().probe_agent(&agent).await,
        ProbeOutcome::Failure
    );
}

#[tokio::test]
async fn recovery_verifies_token_over_http() {
    let live = Live::start().await;
    let agent = live
        .registry
        .register(CLIENT_IP, &live.agent_url(), "lost-key")
        .await
        .unwrap();

    let start = live
        .registry
        .start_recovery(CLIENT_IP, agent.id)
        .await
        .unwrap();
    assert!(start.verification_url.starts_with(&format!("http://{HOST}:")));

    Mock::given(method("GET"))
        .and(path("/.well-known/agora-verify"))
        .respond_with(ResponseTemplate::new(200).set_body_string(start.challenge_token.clone()))
        .expect(1)
        .mount(&live.server)
        .await;

    live.registry
        .complete_recovery(CLIENT_IP, agent.id, "new-key", &start.session_secret)
        .await
        .unwrap();
    live.registry
        .authenticate_owner(agent.id, "new-key")
        .await
        .unwrap();
}
