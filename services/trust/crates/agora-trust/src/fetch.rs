//! Outbound HTTP port and its pinned reqwest implementation.

use std::sync::Arc;
use std::time::Duration;

use agora_common::Settings;
use async_trait::async_trait;
use reqwest::redirect::Policy;
use thiserror::Error;
use url::{Host, Url};

use crate::pinning::PinnedResolver;
use crate::url_safety::SafeOutboundTarget;

const USER_AGENT: &str = concat!("agora-trust/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetch URL host does not match the validated target")]
    HostMismatch,

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Issues one GET against a validated target.
///
/// The target is taken by value: it is consumed by the fetch it guards.
#[async_trait]
pub trait OutboundFetcher: Send + Sync {
    async fn get(&self, url: &str, target: SafeOutboundTarget)
        -> Result<FetchedResponse, FetchError>;
}

/// reqwest-backed fetcher. Every call builds a client whose resolver is
/// pinned to the call's target; redirects and proxies are disabled.
#[derive(Debug, Clone)]
pub struct PinnedHttpFetcher {
    timeout: Duration,
    connect_timeout: Duration,
    max_body_bytes: usize,
}

impl PinnedHttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration, connect_timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            timeout,
            connect_timeout,
            max_body_bytes,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = Duration::from_secs(settings.outbound_http_timeout_seconds.max(1));
        let connect_timeout = Duration::from_secs(settings.dns_resolution_timeout_seconds.max(1));
        Self::new(timeout, connect_timeout.min(timeout), settings.outbound_max_body_bytes)
    }
}

fn host_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    Some(match parsed.host()? {
        Host::Domain(d) => d.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    })
}

fn transport(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

#[async_trait]
impl OutboundFetcher for PinnedHttpFetcher {
    async fn get(
        &self,
        url: &str,
        target: SafeOutboundTarget,
    ) -> Result<FetchedResponse, FetchError> {
        if host_key(url).as_deref() != Some(target.hostname()) {
            return Err(FetchError::HostMismatch);
        }

        let client = reqwest::Client::builder()
            .dns_resolver(Arc::new(PinnedResolver::for_target(&target)))
            .redirect(Policy::none())
            .no_proxy()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        let mut response = client.get(url).send().await.map_err(|e| transport(&e))?;
        let status = response.status().as_u16();

        let limit = self.max_body_bytes;
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(FetchError::BodyTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| transport(&e))? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(
            host = target.hostname(),
            pinned_ip = %target.pinned_ip(),
            status,
            bytes = body.len(),
            "outbound fetch complete"
        );
        Ok(FetchedResponse { status, body })
    }
}
