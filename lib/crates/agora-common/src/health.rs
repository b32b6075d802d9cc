//! Health state machine and staleness derivation.
//!
//! This module is free of I/O and async. Probe execution lives in the trust
//! service; everything here takes data in and returns data out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Health status of a registered agent.
///
/// Starts as `Unknown` and never returns to it once a probe has been recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Result of one probe cycle for one agent (all candidates considered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// Persisted health fields of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HealthRecord {
    pub status: HealthStatus,
    /// When the agent was last probed, successful or not.
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
    /// When the agent last answered a probe successfully.
    /// Only a successful probe moves this forward; failures leave it alone.
    #[serde(default)]
    pub last_known_good_at: Option<DateTime<Utc>>,
}

/// Derived stale flag. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct Staleness {
    pub is_stale: bool,
    /// Whole days since the reference timestamp; 0 when not stale.
    pub stale_days: i64,
}

// ── Pure functions ────────────────────────────────────────────────────────────

impl HealthRecord {
    /// Return the record that results from applying `outcome` observed at `at`.
    #[must_use]
    pub fn apply(&self, outcome: ProbeOutcome, at: DateTime<Utc>) -> Self {
        match outcome {
            ProbeOutcome::Success => Self {
                status: HealthStatus::Healthy,
                last_probe_at: Some(at),
                last_known_good_at: Some(at),
            },
            ProbeOutcome::Failure => Self {
                status: HealthStatus::Unhealthy,
                last_probe_at: Some(at),
                last_known_good_at: self.last_known_good_at,
            },
        }
    }

    /// Staleness of this record at `now` for an agent registered at `registered_at`.
    #[must_use]
    pub fn staleness(
        &self,
        registered_at: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold_days: u32,
    ) -> Staleness {
        compute_staleness(self, registered_at, now, threshold_days)
    }
}

/// Compute the stale flag for a health record.
///
/// Only `unhealthy` agents can be stale. The reference point is the last
/// successful probe, or the registration time when the agent never answered.
/// Stale means strictly more than `threshold_days` have elapsed.
#[must_use]
pub fn compute_staleness(
    record: &HealthRecord,
    registered_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_days: u32,
) -> Staleness {
    if record.status != HealthStatus::Unhealthy {
        return Staleness::default();
    }

    let reference = record.last_known_good_at.unwrap_or(registered_at);
    let elapsed = now - reference;
    if elapsed > Duration::days(i64::from(threshold_days)) {
        Staleness {
            is_stale: true,
            stale_days: elapsed.num_days(),
        }
    } else {
        Staleness::default()
    }
}
