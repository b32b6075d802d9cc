//! Sliding-window rate limiting.
//!
//! [`RateLimiter`] is the strategy; [`MemoryRateLimiter`] serves a single
//! instance, [`ValkeyRateLimiter`] enforces one quota across instances.
//! Which one runs is decided once, by [`build_rate_limiter`].

pub mod memory;
pub mod valkey;

use std::sync::Arc;
use std::time::Duration;

use agora_common::{RateLimitBackendKind, Settings};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryRateLimiter;
pub use valkey::ValkeyRateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Zero when allowed, at least one otherwise.
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }

    #[must_use]
    pub fn deny(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: retry_after_seconds.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded ({scope}); retry after {retry_after_seconds}s")]
    Limited {
        scope: String,
        retry_after_seconds: u64,
    },

    /// The limiter itself failed. Never treated as allow or deny.
    #[error("rate limit backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Atomically prune, count, and (when admitted) record one event for `key`.
    ///
    /// `limit == 0` always denies.
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, RateLimitError>;

    fn backend_name(&self) -> &'static str;
}

/// One bucket of a composite policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Label reported on rejection, e.g. `register:ip`.
    pub scope: String,
    pub key: String,
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub fn new(scope: &str, bucket: &str, limit: u32, window_seconds: u64) -> Self {
        Self {
            scope: scope.to_string(),
            key: format!("{scope}:{bucket}"),
            limit,
            window_seconds,
        }
    }
}

/// Check every rule in order; the first rejection wins and later rules are
/// not consulted (nor recorded).
pub async fn enforce_all(
    limiter: &dyn RateLimiter,
    rules: &[RateLimitRule],
) -> Result<(), RateLimitError> {
    for rule in rules {
        let decision = limiter
            .check(&rule.key, rule.limit, rule.window_seconds)
            .await
            .inspect_err(|e| {
                tracing::error!(scope = %rule.scope, backend = limiter.backend_name(), error = %e, "rate limit check failed");
            })?;
        if !decision.allowed {
            tracing::warn!(
                scope = %rule.scope,
                retry_after_seconds = decision.retry_after_seconds,
                "rate limit exceeded"
            );
            return Err(RateLimitError::Limited {
                scope: rule.scope.clone(),
                retry_after_seconds: decision.retry_after_seconds,
            });
        }
    }
    Ok(())
}

/// Select and initialise the configured backend.
///
/// `auto` uses Valkey when a URL is configured. An unreachable Valkey at
/// start-up is an error, not a silent downgrade to memory.
pub async fn build_rate_limiter(settings: &Settings) -> Result<Arc<dyn RateLimiter>> {
    let url = settings.valkey_url.as_deref().filter(|u| !u.is_empty());
    match (settings.rate_limit_backend, url) {
        (RateLimitBackendKind::Memory, _) | (RateLimitBackendKind::Auto, None) => {
            tracing::info!(backend = "memory", "rate limiter ready");
            Ok(Arc::new(MemoryRateLimiter::new()))
        }
        (RateLimitBackendKind::Valkey, None) => {
            bail!("rate_limit_backend=valkey requires AGORA_VALKEY_URL")
        }
        (RateLimitBackendKind::Valkey | RateLimitBackendKind::Auto, Some(url)) => {
            let limiter = ValkeyRateLimiter::connect(
                url,
                &settings.rate_limit_prefix,
                Duration::from_millis(settings.rate_limit_command_timeout_ms.max(1)),
            )
            .await
            .context("failed to initialise Valkey rate limiter")?;
            Ok(Arc::new(limiter))
        }
    }
}
