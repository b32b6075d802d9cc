/// Valkey key prefixes for agora shared state
pub mod keys {
    /// Sliding-window rate limit buckets (sorted set)
    /// Format: agora:rate_limit:{sha256 hex of the bucket id}
    /// Score: server time in microseconds
    /// Member: unique event id
    /// TTL: window length (refreshed on every admitted event)
    pub const RATE_LIMIT: &str = "agora:rate_limit";
}

/// TTL constants
pub mod ttl {
    /// Recovery challenge lifetime (15 minutes)
    pub const RECOVERY_CHALLENGE_SECS: u64 = 900;

    /// How far back the query tracker looks when selecting probe candidates (24 hours)
    pub const PROBE_LOOKBACK_SECS: u64 = 86_400;

    /// Interval between background health-check cycles (1 hour)
    pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 3600;
}

/// Size and threshold limits shared by validators and serializers
pub mod limits {
    /// Unhealthy agents whose last good probe is older than this are stale.
    pub const STALE_THRESHOLD_DAYS: u32 = 7;

    /// Longest accepted agent URL.
    pub const MAX_AGENT_URL_LENGTH: usize = 2048;
}

/// Well-known paths on a registered agent's origin
pub mod well_known {
    /// A2A Agent Card location probed by the health checker.
    pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

    /// Where a registrant publishes the recovery challenge token.
    pub const RECOVERY_VERIFICATION_PATH: &str = "/.well-known/agora-verify";
}

/// Build the Valkey key for a rate-limit bucket under `prefix`.
///
/// `bucket_digest` is the hex digest of the bucket id, never the raw id:
/// bucket ids embed caller-controlled values (IPs, fingerprints) and the
/// digest keeps every key the same size and charset.
pub fn rate_limit_key(prefix: &str, bucket_digest: &str) -> String {
    format!("{prefix}:{bucket_digest}")
}
