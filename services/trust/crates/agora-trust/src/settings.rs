//! Loading [`Settings`] from `AGORA_*` environment variables.

use agora_common::{RateLimitBackendKind, Settings};
use anyhow::{Context, Result, ensure};

pub const ENV_PREFIX: &str = "AGORA_";

/// Read settings from the process environment.
pub fn load_settings() -> Result<Settings> {
    let settings = settings_from_vars(std::env::vars())?;
    tracing::info!(?settings, "configuration loaded");
    Ok(settings)
}

/// `(name, value)` pairs, names including the prefix.
fn settings_from_vars<I>(vars: I) -> Result<Settings>
where
    I: IntoIterator<Item = (String, String)>,
{
    let settings: Settings = envy::prefixed(ENV_PREFIX)
        .from_iter(vars)
        .context("failed to load config from AGORA_* env vars")?;
    check(&settings)?;
    Ok(settings)
}

fn uses_shared_limiter(settings: &Settings) -> bool {
    let has_url = settings.valkey_url.as_deref().is_some_and(|u| !u.is_empty());
    match settings.rate_limit_backend {
        RateLimitBackendKind::Valkey => true,
        RateLimitBackendKind::Auto => has_url,
        RateLimitBackendKind::Memory => false,
    }
}

fn check(settings: &Settings) -> Result<()> {
    ensure!(
        settings.recovery_challenge_ttl_seconds > 0,
        "AGORA_RECOVERY_CHALLENGE_TTL_SECONDS must be positive"
    );
    ensure!(
        settings.outbound_http_timeout_seconds > 0,
        "AGORA_OUTBOUND_HTTP_TIMEOUT_SECONDS must be positive"
    );
    ensure!(
        settings.health_check_interval_seconds > 0,
        "AGORA_HEALTH_CHECK_INTERVAL_SECONDS must be positive"
    );
    ensure!(
        !(settings.rate_limit_backend == RateLimitBackendKind::Valkey
            && settings.valkey_url.as_deref().is_none_or(str::is_empty)),
        "AGORA_RATE_LIMIT_BACKEND=valkey requires AGORA_VALKEY_URL"
    );
    ensure!(
        settings.fingerprint_key.as_deref().is_none_or(|k| !k.is_empty()),
        "AGORA_FINGERPRINT_KEY must not be empty"
    );
    // Instances sharing a limiter must agree on per-key bucket ids.
    ensure!(
        !uses_shared_limiter(settings) || settings.fingerprint_key.is_some(),
        "AGORA_FINGERPRINT_KEY is required when the rate limiter is shared through Valkey"
    );
    if settings.allow_private_network_targets {
        tracing::warn!("private network targets are allowed; SSRF protection is reduced");
    }
    Ok(())
}
