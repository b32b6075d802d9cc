//! The trust core as the route layer sees it.
//!
//! Each operation runs its rate-limit policy first, then the safety,
//! credential, or recovery logic, and reports failures as [`TrustError`].

use std::sync::Arc;
use std::time::Duration;

use agora_common::{AgentId, AgentIdentity, Clock, Settings, Staleness, SystemClock};
use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::{CredentialStore, verify_admin_token};
use crate::error::TrustError;
use crate::fetch::{OutboundFetcher, PinnedHttpFetcher};
use crate::normalize::normalize_url;
use crate::probe::{HealthProber, QueryTracker, run_probe_loop};
use crate::rate_limit::{RateLimitRule, RateLimiter, build_rate_limiter, enforce_all};
use crate::recovery::{RecoveryService, RecoveryStart};
use crate::repository::{AgentRepository, MemoryRepository, WriteOutcome};
use crate::resolver::{HostResolver, SystemResolver};
use crate::url_safety::UrlSafetyValidator;

const GLOBAL_BUCKET: &str = "all";

/// Per-endpoint limits derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct RateLimitPolicies {
    settings: Settings,
}

impl RateLimitPolicies {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    /// Per-IP, per-key (when a key fingerprint is known), then global.
    #[must_use]
    pub fn registration(&self, client_ip: &str, key_fingerprint: Option<&str>) -> Vec<RateLimitRule> {
        let s = &self.settings;
        let window = s.registration_rate_limit_window_seconds;
        let mut rules = vec![RateLimitRule::new("register:ip", client_ip, s.registration_rate_limit_per_ip, window)];
        if let Some(fp) = key_fingerprint {
            rules.push(RateLimitRule::new("register:key", fp, s.registration_rate_limit_per_api_key, window));
        }
        rules.push(RateLimitRule::new("register:global", GLOBAL_BUCKET, s.registration_rate_limit_global, window));
        rules
    }

    #[must_use]
    pub fn listing(&self, client_ip: &str, key_fingerprint: Option<&str>) -> Vec<RateLimitRule> {
        let s = &self.settings;
        let window = s.list_agents_rate_limit_window_seconds;
        let mut rules = vec![RateLimitRule::new("list:ip", client_ip, s.list_agents_rate_limit_per_ip, window)];
        if let Some(fp) = key_fingerprint {
            rules.push(RateLimitRule::new("list:key", fp, s.list_agents_rate_limit_per_api_key, window));
        }
        rules.push(RateLimitRule::new("list:global", GLOBAL_BUCKET, s.list_agents_rate_limit_global, window));
        rules
    }

    #[must_use]
    pub fn admin(&self, client_ip: &str) -> Vec<RateLimitRule> {
        let s = &self.settings;
        let window = s.admin_rate_limit_window_seconds;
        vec![
            RateLimitRule::new("admin:ip", client_ip, s.admin_rate_limit_per_ip, window),
            RateLimitRule::new("admin:global", GLOBAL_BUCKET, s.admin_rate_limit_global, window),
        ]
    }

    #[must_use]
    pub fn recovery(&self, client_ip: &str, agent: AgentId) -> Vec<RateLimitRule> {
        let s = &self.settings;
        let window = s.recovery_rate_limit_window_seconds;
        vec![
            RateLimitRule::new("recovery:ip", client_ip, s.recovery_rate_limit_per_ip, window),
            RateLimitRule::new("recovery:agent", &agent.to_string(), s.recovery_rate_limit_per_agent, window),
        ]
    }
}

/// Collaborators a [`Registry`] is assembled from.
pub struct RegistryDeps {
    pub repository: Arc<dyn AgentRepository>,
    pub resolver: Arc<dyn HostResolver>,
    pub fetcher: Arc<dyn OutboundFetcher>,
    pub limiter: Arc<dyn RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

pub struct Registry {
    settings: Settings,
    repository: Arc<dyn AgentRepository>,
    credentials: Arc<CredentialStore>,
    validator: UrlSafetyValidator,
    fetcher: Arc<dyn OutboundFetcher>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    tracker: Arc<QueryTracker>,
    policies: RateLimitPolicies,
    recovery: RecoveryService,
}

impl Registry {
    pub fn new(settings: Settings, deps: RegistryDeps) -> Result<Self, TrustError> {
        let credentials = Arc::new(CredentialStore::new(&settings)?);
        let validator = UrlSafetyValidator::new(deps.resolver);
        let recovery = RecoveryService::new(
            Arc::clone(&deps.repository),
            Arc::clone(&credentials),
            validator.clone(),
            Arc::clone(&deps.fetcher),
            Arc::clone(&deps.clock),
            settings.recovery_challenge_ttl_seconds,
            settings.allow_private_network_targets,
        );
        Ok(Self {
            policies: RateLimitPolicies::from_settings(&settings),
            repository: deps.repository,
            credentials,
            validator,
            fetcher: deps.fetcher,
            limiter: deps.limiter,
            clock: deps.clock,
            tracker: Arc::new(QueryTracker::new()),
            recovery,
            settings,
        })
    }

    /// Production wiring: system resolver, pinned reqwest fetcher, the
    /// configured rate-limit backend, in-memory storage.
    pub async fn bootstrap(settings: Settings) -> anyhow::Result<Self> {
        let limiter = build_rate_limiter(&settings).await?;
        let deps = RegistryDeps {
            repository: Arc::new(MemoryRepository::new()),
            resolver: Arc::new(SystemResolver::new(Duration::from_secs(
                settings.dns_resolution_timeout_seconds.max(1),
            ))),
            fetcher: Arc::new(PinnedHttpFetcher::from_settings(&settings)),
            limiter,
            clock: Arc::new(SystemClock),
        };
        Self::new(settings, deps).context("failed to assemble trust core")
    }

    /// Register a new agent owned by `api_key`.
    pub async fn register(
        &self,
        client_ip: &str,
        raw_url: &str,
        api_key: &str,
    ) -> Result<AgentIdentity, TrustError> {
        let key_fingerprint = (!api_key.is_empty()).then(|| self.credentials.fingerprint(api_key));
        enforce_all(
            self.limiter.as_ref(),
            &self.policies.registration(client_ip, key_fingerprint.as_deref()),
        )
        .await?;
        if api_key.trim().is_empty() {
            return Err(TrustError::InvalidCredential);
        }

        let url = normalize_url(raw_url)?;
        self.validator
            .validate_for_registration(
                &url,
                self.settings.allow_private_network_targets,
                self.settings.allow_unresolvable_registration_hostnames,
            )
            .await?;
        if self.repository.find_by_url(&url).await?.is_some() {
            return Err(TrustError::DuplicateUrl);
        }

        let owner_hash = self.credentials.hash_detached(api_key).await?;
        let identity = AgentIdentity::new(url, owner_hash.into_string(), self.clock.now());
        self.repository.insert(identity.clone()).await?;

        tracing::info!(agent_id = %identity.id, url = %identity.url, "agent registered");
        Ok(identity)
    }

    /// Verify `api_key` against the agent's owner credential.
    ///
    /// A legacy or outdated hash is replaced after successful verification.
    /// Losing that replacement to a concurrent writer is not an error.
    pub async fn authenticate_owner(&self, id: AgentId, api_key: &str) -> Result<AgentIdentity, TrustError> {
        let identity = self.repository.get(id).await?.ok_or(TrustError::NotFound)?;
        let stored = identity.owner_key_hash.clone();
        if !self.credentials.verify_detached(api_key, stored.as_deref()).await? {
            tracing::warn!(agent_id = %id, "owner credential rejected");
            return Err(TrustError::InvalidCredential);
        }

        let Some(stored) = stored else {
            return Ok(identity);
        };
        if self.credentials.should_rehash(&stored) {
            let fresh = self.credentials.hash_detached(api_key).await?;
            match self
                .repository
                .replace_owner_hash(id, &stored, fresh.into_string())
                .await
            {
                Ok(WriteOutcome::Applied) => {
                    tracing::info!(agent_id = %id, "owner credential hash upgraded");
                }
                Ok(outcome) => {
                    tracing::debug!(agent_id = %id, ?outcome, "credential upgrade skipped");
                }
                Err(e) => {
                    tracing::warn!(agent_id = %id, error = %e, "credential upgrade failed");
                }
            }
            return Ok(self.repository.get(id).await?.unwrap_or(identity));
        }
        Ok(identity)
    }

    /// Gate a listing or search request.
    pub async fn guard_listing(&self, client_ip: &str, api_key: Option<&str>) -> Result<(), TrustError> {
        let fingerprint = api_key
            .filter(|k| !k.is_empty())
            .map(|k| self.credentials.fingerprint(k));
        enforce_all(
            self.limiter.as_ref(),
            &self.policies.listing(client_ip, fingerprint.as_deref()),
        )
        .await?;
        Ok(())
    }

    /// Gate an admin request: rate limits first, then the token.
    pub async fn guard_admin(&self, client_ip: &str, presented_token: Option<&str>) -> Result<(), TrustError> {
        enforce_all(self.limiter.as_ref(), &self.policies.admin(client_ip)).await?;
        if !verify_admin_token(presented_token, self.settings.admin_api_token.as_deref()) {
            tracing::warn!(client_ip, "admin token rejected");
            return Err(TrustError::InvalidCredential);
        }
        Ok(())
    }

    pub async fn start_recovery(&self, client_ip: &str, id: AgentId) -> Result<RecoveryStart, TrustError> {
        enforce_all(self.limiter.as_ref(), &self.policies.recovery(client_ip, id)).await?;
        Ok(self.recovery.start(id).await?)
    }

    pub async fn complete_recovery(
        &self,
        client_ip: &str,
        id: AgentId,
        new_api_key: &str,
        session_secret: &str,
    ) -> Result<(), TrustError> {
        enforce_all(self.limiter.as_ref(), &self.policies.recovery(client_ip, id)).await?;
        Ok(self.recovery.complete(id, new_api_key, session_secret).await?)
    }

    /// Record that these agents were served, making them probe candidates.
    pub fn note_queried(&self, ids: &[AgentId]) {
        let now = self.clock.now();
        for id in ids {
            self.tracker.mark(*id, now);
        }
    }

    #[must_use]
    pub fn staleness(&self, identity: &AgentIdentity) -> Staleness {
        identity.staleness(self.clock.now(), self.settings.stale_threshold_days)
    }

    /// A prober sharing this registry's storage, tracker, and fetcher.
    #[must_use]
    pub fn prober(&self) -> HealthProber {
        HealthProber::new(
            Arc::clone(&self.repository),
            self.validator.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.tracker),
            Arc::clone(&self.clock),
            self.settings.probe_lookback_hours,
            self.settings.allow_private_network_targets,
        )
    }

    /// Run [`run_probe_loop`] on the configured interval until `cancel` fires.
    pub fn spawn_probe_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.health_check_interval_seconds.max(1));
        tokio::spawn(run_probe_loop(Arc::new(self.prober()), interval, cancel))
    }
}
