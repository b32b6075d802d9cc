#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod card;
pub mod clock;
pub mod config;
pub mod health;
pub mod redis_keys;
pub mod types;

pub use card::{validate_agent_card, AgentCard, CardError, SkillCard};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimitBackendKind, Settings};
pub use health::{compute_staleness, HealthRecord, HealthStatus, ProbeOutcome, Staleness};
pub use redis_keys::{keys, limits, rate_limit_key, ttl, well_known};
pub use types::*;
