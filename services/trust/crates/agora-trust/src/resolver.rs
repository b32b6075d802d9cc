//! Hostname resolution port.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("resolution of {host} failed: {reason}")]
    Failed { host: String, reason: String },

    #[error("resolution of {host} timed out")]
    Timeout { host: String },

    #[error("{host} resolved to no addresses")]
    NoAddresses { host: String },
}

/// Resolves a hostname to every A/AAAA address it currently has.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Addresses in resolver order with duplicates removed. Never empty on success.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// The operating system resolver (`getaddrinfo` via tokio), bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn dedupe(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut seen = Vec::new();
    for ip in addrs {
        if !seen.contains(&ip) {
            seen.push(ip);
        }
    }
    seen
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| ResolveError::Timeout {
                host: host.to_string(),
            })?
            .map_err(|e| ResolveError::Failed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let resolved = dedupe(addrs.map(|sa| sa.ip()));
        if resolved.is_empty() {
            return Err(ResolveError::NoAddresses {
                host: host.to_string(),
            });
        }
        tracing::debug!(host, count = resolved.len(), "resolved hostname");
        Ok(resolved)
    }
}

/// Fixed host table. Unknown names fail like NXDOMAIN.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.entries
            .insert(host.trim_end_matches('.').to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let key = host.trim_end_matches('.').to_ascii_lowercase();
        match self.entries.get(&key) {
            Some(ips) if !ips.is_empty() => Ok(dedupe(ips.iter().copied())),
            Some(_) => Err(ResolveError::NoAddresses {
                host: host.to_string(),
            }),
            None => Err(ResolveError::Failed {
                host: host.to_string(),
                reason: "name not known".to_string(),
            }),
        }
    }
}
