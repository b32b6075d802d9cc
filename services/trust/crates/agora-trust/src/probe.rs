//! Background health probing of recently queried agents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_common::{
    AgentId, AgentIdentity, Clock, ProbeOutcome, ProbeSummary, validate_agent_card, well_known,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::fetch::OutboundFetcher;
use crate::repository::{AgentRepository, RepositoryError};
use crate::url_safety::UrlSafetyValidator;

/// Last time each agent was served to a client.
#[derive(Debug, Default)]
pub struct QueryTracker {
    last_queried: Mutex<HashMap<AgentId, DateTime<Utc>>>,
}

impl QueryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: AgentId, at: DateTime<Utc>) {
        self.last_queried.lock().insert(id, at);
    }

    /// Ids queried at or after `now - within`, oldest entries pruned.
    pub fn recent(&self, within: chrono::Duration, now: DateTime<Utc>) -> Vec<AgentId> {
        let cutoff = now - within;
        let mut map = self.last_queried.lock();
        map.retain(|_, at| *at >= cutoff);
        let mut ids: Vec<AgentId> = map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_queried.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Probe URLs for an agent, in priority order, de-duplicated:
/// the origin's Agent Card, the agent URL itself, the origin root.
#[must_use]
pub fn probe_candidates(agent_url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(agent_url) else {
        return Vec::new();
    };
    if parsed.host_str().is_none_or(str::is_empty) {
        return Vec::new();
    }
    let origin = parsed.origin().ascii_serialization();

    let mut bare = parsed.clone();
    bare.set_query(None);
    bare.set_fragment(None);

    let mut candidates: Vec<String> = Vec::with_capacity(3);
    for candidate in [
        format!("{origin}{}", well_known::AGENT_CARD_PATH),
        bare.to_string(),
        format!("{origin}/"),
    ] {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

pub struct HealthProber {
    repository: Arc<dyn AgentRepository>,
    validator: UrlSafetyValidator,
    fetcher: Arc<dyn OutboundFetcher>,
    tracker: Arc<QueryTracker>,
    clock: Arc<dyn Clock>,
    lookback: chrono::Duration,
    allow_private: bool,
}

impl HealthProber {
    #[must_use]
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        validator: UrlSafetyValidator,
        fetcher: Arc<dyn OutboundFetcher>,
        tracker: Arc<QueryTracker>,
        clock: Arc<dyn Clock>,
        lookback_hours: u64,
        allow_private: bool,
    ) -> Self {
        let hours = i64::try_from(lookback_hours).unwrap_or(i64::MAX);
        Self {
            repository,
            validator,
            fetcher,
            tracker,
            clock,
            lookback: chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX),
            allow_private,
        }
    }

    async fn try_candidate(&self, url: &str) -> Result<(), String> {
        let target = self
            .validator
            .validate_for_outbound(url, self.allow_private)
            .await
            .map_err(|e| e.to_string())?;
        let response = self
            .fetcher
            .get(url, target)
            .await
            .map_err(|e| e.to_string())?;
        if !response.is_success() {
            return Err(format!("status {}", response.status));
        }
        let payload: serde_json::Value =
            serde_json::from_slice(&response.body).map_err(|e| format!("invalid JSON: {e}"))?;
        validate_agent_card(&payload).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// First candidate that serves a valid Agent Card wins.
    pub async fn probe_agent(&self, agent: &AgentIdentity) -> ProbeOutcome {
        for candidate in probe_candidates(&agent.url) {
            match self.try_candidate(&candidate).await {
                Ok(()) => {
                    tracing::debug!(agent_id = %agent.id, url = %candidate, "probe succeeded");
                    return ProbeOutcome::Success;
                }
                Err(reason) => {
                    tracing::debug!(agent_id = %agent.id, url = %candidate, %reason, "probe candidate failed");
                }
            }
        }
        ProbeOutcome::Failure
    }

    /// One pass over the agents queried within the look-back window.
    ///
    /// Agents are probed one at a time. On cancellation the remaining agents
    /// are counted as skipped and their records are left untouched.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<ProbeSummary, RepositoryError> {
        let mut summary = ProbeSummary::default();
        let ids = self.tracker.recent(self.lookback, self.clock.now());
        if ids.is_empty() {
            return Ok(summary);
        }

        let agents = self.repository.agents_to_probe(&ids).await?;
        summary.skipped_count = ids.len().saturating_sub(agents.len());

        for agent in &agents {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                outcome = self.probe_agent(agent) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                summary.skipped_count += 1;
                continue;
            };

            match self
                .repository
                .apply_probe_outcome(agent.id, outcome, self.clock.now())
                .await
            {
                Ok(Some(_)) => {
                    summary.checked_count += 1;
                    match outcome {
                        ProbeOutcome::Success => summary.healthy_count += 1,
                        ProbeOutcome::Failure => summary.unhealthy_count += 1,
                    }
                }
                Ok(None) => summary.skipped_count += 1,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, error = %e, "failed to record probe outcome");
                    summary.skipped_count += 1;
                }
            }
        }

        tracing::info!(
            checked = summary.checked_count,
            healthy = summary.healthy_count,
            unhealthy = summary.unhealthy_count,
            skipped = summary.skipped_count,
            "health check cycle complete"
        );
        Ok(summary)
    }
}

/// Run a cycle now, then every `interval`, until `cancel` fires.
///
/// Each cycle runs in its own task: a failed or panicking cycle is logged and
/// the loop carries on.
pub async fn run_probe_loop(prober: Arc<HealthProber>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "health probe loop started");
    loop {
        let cycle = tokio::spawn({
            let prober = Arc::clone(&prober);
            let cancel = cancel.clone();
            async move { prober.run_cycle(&cancel).await }
        });
        match cycle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "health check cycle failed"),
            Err(e) => tracing::error!(error = %e, "health check cycle aborted"),
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("health probe loop stopped");
}
