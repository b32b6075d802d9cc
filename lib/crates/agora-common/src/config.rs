use std::fmt;

use serde::Deserialize;

use crate::redis_keys::{keys, limits, ttl};

/// Which rate-limit store backs the limiter.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackendKind {
    /// Valkey when `valkey_url` is set, otherwise in-process memory.
    #[default]
    Auto,
    Memory,
    #[serde(alias = "redis")]
    Valkey,
}

/// Trust-core settings.
///
/// Deserialized from `AGORA_`-prefixed environment variables by the service
/// (e.g. `AGORA_VALKEY_URL`, `AGORA_REGISTRATION_RATE_LIMIT_PER_IP`).
/// Every field has a default, so an empty environment yields a working
/// single-instance configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Lifetime of a recovery challenge.
    pub recovery_challenge_ttl_seconds: u64,
    /// Upper bound for any single outbound fetch (probe or recovery check).
    pub outbound_http_timeout_seconds: u64,
    /// Largest response body read from an outbound fetch.
    pub outbound_max_body_bytes: usize,
    /// Upper bound for one hostname resolution.
    pub dns_resolution_timeout_seconds: u64,
    /// Interval between background health-check cycles.
    pub health_check_interval_seconds: u64,
    /// Only agents queried within this window are probed.
    pub probe_lookback_hours: u64,
    pub stale_threshold_days: u32,

    /// ⚠️ SECURITY: disables private/internal range blocking. Test and
    /// air-gapped deployments only.
    pub allow_private_network_targets: bool,
    /// Accept registrations whose hostname does not resolve yet.
    pub allow_unresolvable_registration_hostnames: bool,

    pub rate_limit_backend: RateLimitBackendKind,
    /// Valkey (Redis-compatible) connection URL for the shared limiter.
    pub valkey_url: Option<String>,
    pub rate_limit_prefix: String,
    /// Per-command deadline against the shared limiter.
    pub rate_limit_command_timeout_ms: u64,

    pub registration_rate_limit_per_ip: u32,
    pub registration_rate_limit_per_api_key: u32,
    pub registration_rate_limit_global: u32,
    pub registration_rate_limit_window_seconds: u64,

    pub list_agents_rate_limit_per_ip: u32,
    pub list_agents_rate_limit_per_api_key: u32,
    pub list_agents_rate_limit_global: u32,
    pub list_agents_rate_limit_window_seconds: u64,

    pub admin_rate_limit_per_ip: u32,
    pub admin_rate_limit_global: u32,
    pub admin_rate_limit_window_seconds: u64,

    pub recovery_rate_limit_per_ip: u32,
    pub recovery_rate_limit_per_agent: u32,
    pub recovery_rate_limit_window_seconds: u64,

    /// Argon2id iterations.
    pub argon2_time_cost: u32,
    /// Argon2id memory in KiB.
    pub argon2_memory_kib: u32,
    /// Argon2id lanes.
    pub argon2_parallelism: u32,
    /// HMAC key for credential fingerprints (rate-limit buckets).
    ///
    /// When unset, each process draws a random key at start-up, so
    /// fingerprints are only comparable within that process.
    pub fingerprint_key: Option<String>,

    /// Token for admin endpoints. Admin access is disabled when unset.
    pub admin_api_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recovery_challenge_ttl_seconds: ttl::RECOVERY_CHALLENGE_SECS,
            outbound_http_timeout_seconds: 10,
            outbound_max_body_bytes: 1_048_576,
            dns_resolution_timeout_seconds: 5,
            health_check_interval_seconds: ttl::HEALTH_CHECK_INTERVAL_SECS,
            probe_lookback_hours: ttl::PROBE_LOOKBACK_SECS / 3600,
            stale_threshold_days: limits::STALE_THRESHOLD_DAYS,
            allow_private_network_targets: false,
            allow_unresolvable_registration_hostnames: false,
            rate_limit_backend: RateLimitBackendKind::Auto,
            valkey_url: None,
            rate_limit_prefix: keys::RATE_LIMIT.to_string(),
            rate_limit_command_timeout_ms: 500,
            registration_rate_limit_per_ip: 10,
            registration_rate_limit_per_api_key: 10,
            registration_rate_limit_global: 200,
            registration_rate_limit_window_seconds: 3600,
            list_agents_rate_limit_per_ip: 100,
            list_agents_rate_limit_per_api_key: 1000,
            list_agents_rate_limit_global: 5000,
            list_agents_rate_limit_window_seconds: 60,
            admin_rate_limit_per_ip: 30,
            admin_rate_limit_global: 300,
            admin_rate_limit_window_seconds: 60,
            recovery_rate_limit_per_ip: 5,
            recovery_rate_limit_per_agent: 5,
            recovery_rate_limit_window_seconds: 900,
            argon2_time_cost: 3,
            argon2_memory_kib: 65_536,
            argon2_parallelism: 4,
            fingerprint_key: None,
            admin_api_token: None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("recovery_challenge_ttl_seconds", &self.recovery_challenge_ttl_seconds)
            .field("outbound_http_timeout_seconds", &self.outbound_http_timeout_seconds)
            .field("allow_private_network_targets", &self.allow_private_network_targets)
            .field(
                "allow_unresolvable_registration_hostnames",
                &self.allow_unresolvable_registration_hostnames,
            )
            .field("rate_limit_backend", &self.rate_limit_backend)
            .field("valkey_configured", &self.valkey_url.is_some())
            .field("rate_limit_prefix", &self.rate_limit_prefix)
            .field("fingerprint_key_configured", &self.fingerprint_key.is_some())
            .field("admin_enabled", &self.admin_api_token.is_some())
            .finish_non_exhaustive()
    }
}
