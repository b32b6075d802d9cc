//! Per-fetch DNS pinning.
//!
//! The HTTP client built for one outbound fetch gets a resolver that knows a
//! single name: the hostname validated by the safety check, answered with the
//! IP that was validated. Any other lookup fails. Nothing is shared between
//! fetches, so concurrent fetches never contend and nothing needs restoring.

use std::net::{IpAddr, SocketAddr};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use thiserror::Error;

use crate::url_safety::SafeOutboundTarget;

#[derive(Debug, Error)]
#[error("refusing to resolve {0}: not the pinned host")]
pub struct UnpinnedHost(String);

/// A resolver that answers exactly one hostname with exactly one address.
#[derive(Debug, Clone)]
pub struct PinnedResolver {
    hostname: String,
    pinned_ip: IpAddr,
}

fn canonical(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl PinnedResolver {
    #[must_use]
    pub fn for_target(target: &SafeOutboundTarget) -> Self {
        Self {
            hostname: canonical(target.hostname()),
            pinned_ip: target.pinned_ip(),
        }
    }

    fn answer(&self, name: &str) -> Result<IpAddr, UnpinnedHost> {
        if canonical(name) == self.hostname {
            Ok(self.pinned_ip)
        } else {
            Err(UnpinnedHost(name.to_string()))
        }
    }
}

impl Resolve for PinnedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let result = match self.answer(name.as_str()) {
            // The connector substitutes the URL's port.
            Ok(ip) => Ok(Box::new(std::iter::once(SocketAddr::new(ip, 0))) as Addrs),
            Err(err) => {
                tracing::warn!(host = name.as_str(), "blocked lookup outside the pinned host");
                Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            }
        };
        Box::pin(std::future::ready(result))
    }
}
