//! Shared sliding window on Valkey.
//!
//! Each bucket is a sorted set of event ids scored by server time in
//! microseconds. Prune, count, and record run inside one Lua script, so two
//! instances can never both observe room for the last slot.

use std::future::Future;
use std::time::Duration;

use agora_common::rate_limit_key;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::prelude::*;
use uuid::Uuid;

use super::{RateLimitDecision, RateLimitError, RateLimiter};
use crate::credentials::sha256_hex;

/// KEYS[1] bucket; ARGV limit, window seconds, member id.
/// Returns `{allowed, retry_after_seconds}`.
const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_us = tonumber(ARGV[2]) * 1000000
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000000 + tonumber(t[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_us)
if redis.call('ZCARD', key) < limit then
  redis.call('ZADD', key, now, ARGV[3])
  redis.call('PEXPIRE', key, math.max(1, math.ceil(window_us / 1000)))
  return {1, 0}
end
local retry = 1
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  retry = math.max(1, math.ceil((tonumber(oldest[2]) + window_us - now) / 1000000))
end
return {0, retry}
";

#[derive(Clone)]
pub struct ValkeyRateLimiter {
    client: Client,
    prefix: String,
    command_timeout: Duration,
}

impl ValkeyRateLimiter {
    /// Connect, then confirm the server answers `PING`.
    pub async fn connect(valkey_url: &str, prefix: &str, command_timeout: Duration) -> Result<Self> {
        let config = Config::from_url(valkey_url).context("invalid Valkey URL")?;
        let client = Builder::from_config(config)
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = Duration::from_secs(5);
                conn_config.internal_command_timeout = Duration::from_secs(10);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5))
            .build()?;

        client.init().await.context("Valkey connection failed")?;
        client
            .ping::<String>(None)
            .await
            .context("Valkey startup PING failed")?;

        tracing::info!(prefix, backend = "valkey", "rate limiter ready");
        Ok(Self::from_client(client, prefix, command_timeout))
    }

    /// Wrap an existing client. No connectivity check is made.
    #[must_use]
    pub fn from_client(client: Client, prefix: &str, command_timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            command_timeout,
        }
    }

    /// Valkey key for a bucket id. Any id maps to a fixed-size key.
    fn bucket_key(&self, key: &str) -> String {
        rate_limit_key(&self.prefix, &sha256_hex(key))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, RateLimitError> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RateLimitError::BackendUnavailable(e.to_string())),
            Err(_) => Err(RateLimitError::BackendUnavailable(format!(
                "command exceeded {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }
}

fn decode(reply: &[i64]) -> Result<RateLimitDecision, RateLimitError> {
    match reply {
        [1, ..] => Ok(RateLimitDecision::allow()),
        [0, retry] => Ok(RateLimitDecision::deny(u64::try_from(*retry).unwrap_or(1))),
        other => Err(RateLimitError::BackendUnavailable(format!(
            "unexpected script reply: {other:?}"
        ))),
    }
}

#[async_trait]
impl RateLimiter for ValkeyRateLimiter {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if limit == 0 {
            return Ok(RateLimitDecision::deny(window_seconds));
        }
        let bucket = self.bucket_key(key);
        let args = vec![
            limit.to_string(),
            window_seconds.to_string(),
            Uuid::new_v4().to_string(),
        ];
        let reply: Vec<i64> = self
            .with_timeout(self.client.eval(SLIDING_WINDOW_SCRIPT, vec![bucket], args))
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Valkey rate limit check failed"))?;
        decode(&reply)
    }

    fn backend_name(&self) -> &'static str {
        "valkey"
    }
}
