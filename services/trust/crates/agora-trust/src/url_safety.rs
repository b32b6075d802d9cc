//! SSRF guard for user-supplied URLs.
//!
//! Two entry points with different resolution policies:
//!   - registration: the URL will be stored; an unresolvable host is rejected
//!     unless explicitly allowed.
//!   - outbound: the URL is about to be fetched; resolution must succeed and
//!     the returned [`SafeOutboundTarget`] pins the fetch to a validated IP.
//!
//! A hostname is blocked when *any* of its addresses is in a blocked range.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use thiserror::Error;
use url::{Host, Url};

use crate::resolver::HostResolver;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyError {
    #[error("URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("URL must include a hostname")]
    MissingHost,

    #[error("URL userinfo is not allowed")]
    UserInfo,

    #[error("Private or internal network targets are not allowed")]
    BlockedTarget { host: String },

    #[error("Unable to resolve target hostname")]
    Unresolvable { host: String },
}

/// A host validated for exactly one outbound fetch.
///
/// Not `Clone`: it is produced right before the fetch it guards and is
/// consumed by that fetch.
#[derive(Debug, PartialEq, Eq)]
pub struct SafeOutboundTarget {
    hostname: String,
    pinned_ip: IpAddr,
}

impl SafeOutboundTarget {
    /// Lower-cased hostname without a trailing dot (or the IP literal text).
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn pinned_ip(&self) -> IpAddr {
        self.pinned_ip
    }
}

const LOCALHOST_NAMES: &[&str] = &["localhost", "localhost.localdomain"];

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_unspecified()
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 shared address space (carrier-grade NAT)
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }
    let seg = ip.segments();

    // 64:ff9b::/96 NAT64 carries an IPv4 address in the low 32 bits.
    if seg[..6] == [0x0064, 0xff9b, 0, 0, 0, 0] {
        let [.., hi, lo] = seg;
        let embedded = Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));
        return is_blocked_v4(embedded);
    }

    // Only 2000::/3 is global unicast. Everything else (::/8, fc00::/7,
    // fe80::/10, fec0::/10, ff00::/8, unassigned space) is blocked.
    if (seg[0] & 0xe000) != 0x2000 {
        return true;
    }

    // 2001::/23 IETF protocol assignments (Teredo, benchmarking, ORCHID)
    (seg[0] == 0x2001 && seg[1] < 0x0200)
        // 2001:db8::/32 documentation
        || (seg[0] == 0x2001 && seg[1] == 0x0db8)
        // 2002::/16 6to4
        || seg[0] == 0x2002
}

/// Whether `ip` is private, loopback, link-local, multicast, reserved, or unspecified.
#[must_use]
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

enum TargetHost {
    Ip(IpAddr),
    Name(String),
}

fn parse_target(url: &str) -> Result<(Url, TargetHost), SafetyError> {
    let parsed = Url::parse(url).map_err(|e| match e {
        url::ParseError::EmptyHost | url::ParseError::RelativeUrlWithoutBase => {
            SafetyError::MissingHost
        }
        other => SafetyError::InvalidUrl(other.to_string()),
    })?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(SafetyError::UserInfo);
    }

    let host = match parsed.host() {
        None => return Err(SafetyError::MissingHost),
        Some(Host::Ipv4(v4)) => TargetHost::Ip(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => TargetHost::Ip(IpAddr::V6(v6)),
        Some(Host::Domain(domain)) => {
            let name = domain.trim_end_matches('.').to_ascii_lowercase();
            if name.is_empty() {
                return Err(SafetyError::MissingHost);
            }
            TargetHost::Name(name)
        }
    };
    Ok((parsed, host))
}

fn blocked(host: &str) -> SafetyError {
    SafetyError::BlockedTarget {
        host: host.to_string(),
    }
}

/// Classifies URLs as safe or unsafe for storage and for outbound use.
#[derive(Clone)]
pub struct UrlSafetyValidator {
    resolver: Arc<dyn HostResolver>,
}

impl UrlSafetyValidator {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    /// Validate a URL submitted for registration.
    ///
    /// With `allow_private` no DNS query is made at all.
    pub async fn validate_for_registration(
        &self,
        url: &str,
        allow_private: bool,
        allow_unresolvable: bool,
    ) -> Result<(), SafetyError> {
        let (_, host) = parse_target(url)?;
        let name = match host {
            TargetHost::Ip(ip) => {
                if !allow_private && is_blocked_ip(ip) {
                    return Err(blocked(&ip.to_string()));
                }
                return Ok(());
            }
            TargetHost::Name(name) => name,
        };

        if allow_private {
            return Ok(());
        }
        if LOCALHOST_NAMES.contains(&name.as_str()) {
            return Err(blocked(&name));
        }

        match self.resolver.resolve(&name).await {
            Ok(ips) => {
                if ips.iter().any(|ip| is_blocked_ip(*ip)) {
                    tracing::warn!(host = %name, "registration target resolves into a blocked range");
                    return Err(blocked(&name));
                }
                Ok(())
            }
            Err(err) if allow_unresolvable => {
                tracing::info!(host = %name, error = %err, "accepting unresolvable registration hostname");
                Ok(())
            }
            Err(err) => {
                tracing::debug!(host = %name, error = %err, "registration hostname did not resolve");
                Err(SafetyError::Unresolvable { host: name })
            }
        }
    }

    /// Validate a URL that is about to be fetched and pick the IP to pin.
    ///
    /// Resolution failure is always an error here. The pinned IP is the
    /// first resolved address; every resolved address must be safe.
    pub async fn validate_for_outbound(
        &self,
        url: &str,
        allow_private: bool,
    ) -> Result<SafeOutboundTarget, SafetyError> {
        let (parsed, host) = parse_target(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SafetyError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let name = match host {
            TargetHost::Ip(ip) => {
                if !allow_private && is_blocked_ip(ip) {
                    return Err(blocked(&ip.to_string()));
                }
                return Ok(SafeOutboundTarget {
                    hostname: ip.to_string(),
                    pinned_ip: ip,
                });
            }
            TargetHost::Name(name) => name,
        };

        if !allow_private && LOCALHOST_NAMES.contains(&name.as_str()) {
            return Err(blocked(&name));
        }

        let ips = self.resolver.resolve(&name).await.map_err(|err| {
            tracing::debug!(host = %name, error = %err, "outbound hostname did not resolve");
            SafetyError::Unresolvable { host: name.clone() }
        })?;
        let Some(&pinned_ip) = ips.first() else {
            return Err(SafetyError::Unresolvable { host: name });
        };

        if !allow_private && ips.iter().any(|ip| is_blocked_ip(*ip)) {
            tracing::warn!(host = %name, "outbound target resolves into a blocked range");
            return Err(blocked(&name));
        }

        Ok(SafeOutboundTarget {
            hostname: name,
            pinned_ip,
        })
    }
}
