#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//! Trust and safety core of the Agora agent registry.
//!
//! SSRF-safe outbound fetching, owner credentials and recovery, sliding-window
//! rate limiting, and agent health probing. Routes, storage engines, and
//! rendering live elsewhere and call in through [`registry::Registry`].

pub mod credentials;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod pinning;
pub mod probe;
pub mod rate_limit;
pub mod recovery;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod settings;
pub mod telemetry;
pub mod url_safety;

pub use credentials::{CredentialError, CredentialHash, CredentialStore};
pub use error::{ErrorKind, TrustError};
pub use fetch::{FetchError, FetchedResponse, OutboundFetcher, PinnedHttpFetcher};
pub use normalize::{NormalizationError, normalize_url};
pub use probe::{HealthProber, QueryTracker, probe_candidates, run_probe_loop};
pub use rate_limit::{
    MemoryRateLimiter, RateLimitDecision, RateLimitError, RateLimitRule, RateLimiter,
    ValkeyRateLimiter, build_rate_limiter, enforce_all,
};
pub use recovery::{RecoveryError, RecoveryService, RecoveryStart};
pub use registry::{RateLimitPolicies, Registry, RegistryDeps};
pub use repository::{AgentRepository, MemoryRepository, RepositoryError, WriteOutcome};
pub use resolver::{HostResolver, ResolveError, StaticResolver, SystemResolver};
pub use settings::load_settings;
pub use url_safety::{SafeOutboundTarget, SafetyError, UrlSafetyValidator, is_blocked_ip};
