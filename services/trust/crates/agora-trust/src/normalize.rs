//! Canonical form of agent URLs, used as the registry's uniqueness key.

use agora_common::limits::MAX_AGENT_URL_LENGTH;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("URL is invalid")]
    Invalid,

    #[error("URL scheme must be http or https")]
    UnsupportedScheme(String),

    #[error("URL must include a host")]
    MissingHost,

    #[error("URL userinfo is not allowed")]
    UserInfo,

    #[error("URL has an invalid port")]
    InvalidPort,

    #[error("URL exceeds {MAX_AGENT_URL_LENGTH} characters")]
    TooLong,
}

/// Canonicalise an agent URL.
///
/// Lower-cased scheme and host, default port dropped, IPv6 literal bracketed,
/// non-root trailing slashes trimmed, query kept verbatim, fragment dropped.
pub fn normalize_url(raw: &str) -> Result<String, NormalizationError> {
    let raw = raw.trim();
    if raw.len() > MAX_AGENT_URL_LENGTH {
        return Err(NormalizationError::TooLong);
    }
    let parsed = Url::parse(raw).map_err(|e| match e {
        url::ParseError::InvalidPort => NormalizationError::InvalidPort,
        url::ParseError::EmptyHost => NormalizationError::MissingHost,
        _ => NormalizationError::Invalid,
    })?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(NormalizationError::UnsupportedScheme(scheme.to_string()));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(NormalizationError::UserInfo);
    }
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(NormalizationError::MissingHost)?;

    let mut out = format!("{scheme}://{host}");
    // `port()` is None when the port equals the scheme default.
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let path = parsed.path();
    let trimmed = path.trim_end_matches('/');
    out.push_str(if trimmed.is_empty() { "/" } else { trimmed });

    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}
