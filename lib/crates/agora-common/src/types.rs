use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health::{HealthRecord, Staleness};

/// Opaque identifier of a registered agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AgentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Raised when a path segment is not a valid agent id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent id: {0}")]
pub struct InvalidAgentId(pub String);

impl FromStr for AgentId {
    type Err = InvalidAgentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| InvalidAgentId(s.chars().take(64).collect()))
    }
}

/// An in-progress ownership recovery challenge.
///
/// Only derived values are stored: the challenge token's verification hash
/// and the session secret's fingerprint. Neither secret is recoverable from
/// this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryChallenge {
    /// SHA-256 hex digest of the challenge token the registrant must publish.
    pub challenge_hash: String,
    /// Fingerprint of the session secret handed to the caller of `start`.
    pub session_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RecoveryChallenge {
    /// A challenge is expired from `expires_at` onwards.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Registry record for one agent, limited to the fields the trust core uses.
///
/// `url` is canonical, unique, and never changes after creation; recovery
/// rotates `owner_key_hash` only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: AgentId,
    pub url: String,
    /// Stored owner credential hash. `None` never authenticates.
    #[serde(default)]
    pub owner_key_hash: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub health: HealthRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryChallenge>,
    /// Session fingerprint of the most recently consumed challenge.
    /// Lets a replayed `complete` be reported as already consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_recovery_session: Option<String>,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(url: String, owner_key_hash: String, registered_at: DateTime<Utc>) -> Self {
        Self {
            id: AgentId::new(),
            url,
            owner_key_hash: Some(owner_key_hash),
            registered_at,
            health: HealthRecord::default(),
            recovery: None,
            consumed_recovery_session: None,
        }
    }

    /// The recovery challenge, if one exists and has not expired at `now`.
    #[must_use]
    pub fn active_challenge(&self, now: DateTime<Utc>) -> Option<&RecoveryChallenge> {
        self.recovery.as_ref().filter(|c| !c.is_expired(now))
    }

    #[must_use]
    pub fn staleness(&self, now: DateTime<Utc>, threshold_days: u32) -> Staleness {
        self.health.staleness(self.registered_at, now, threshold_days)
    }
}

/// Counts for one background health-check cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProbeSummary {
    pub checked_count: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    /// Candidates that could not be checked (deleted agents, write failures,
    /// or cancellation before their turn).
    pub skipped_count: usize,
}
