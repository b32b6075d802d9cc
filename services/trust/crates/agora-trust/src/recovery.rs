//! Ownership recovery by proof of control over the registered origin.
//!
//! `start` issues a challenge token (to be published at
//! `<origin>/.well-known/agora-verify`) and a session secret (kept by the
//! caller). `complete` checks both and rotates the owner credential through a
//! conditional write, so one challenge rotates the credential at most once.

use std::fmt;
use std::sync::Arc;

use agora_common::{AgentId, Clock, RecoveryChallenge, well_known};
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use crate::credentials::{CredentialError, CredentialStore, constant_time_eq, generate_secret, sha256_hex};
use crate::fetch::OutboundFetcher;
use crate::repository::{AgentRepository, RepositoryError, WriteOutcome};
use crate::url_safety::{SafetyError, UrlSafetyValidator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("Agent not found")]
    NotFound,

    #[error("No active recovery challenge, or the challenge has expired")]
    NoActiveOrExpiredChallenge,

    #[error("Verification URL could not be fetched: {0}")]
    VerificationUnreachable(String),

    #[error(transparent)]
    UnsafeTarget(SafetyError),

    #[error("Published verification token does not match the challenge")]
    ChallengeMismatch,

    #[error("Recovery session does not match the active challenge")]
    SessionMismatch,

    #[error("Recovery challenge has already been consumed")]
    AlreadyConsumed,

    #[error("New API key must not be empty")]
    InvalidNewCredential,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Storage(RepositoryError),
}

/// Returned once by `start`. The secrets are never stored in clear.
#[derive(Clone)]
pub struct RecoveryStart {
    /// Publish this, exactly, at `verification_url`.
    pub challenge_token: String,
    /// Present this to `complete`.
    pub session_secret: String,
    pub verification_url: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for RecoveryStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStart")
            .field("verification_url", &self.verification_url)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// `<scheme>://<host>[:port]/.well-known/agora-verify` for an agent URL.
pub fn verification_url(agent_url: &str) -> Result<String, SafetyError> {
    let parsed = Url::parse(agent_url).map_err(|e| SafetyError::InvalidUrl(e.to_string()))?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(SafetyError::MissingHost);
    }
    Ok(format!(
        "{}{}",
        parsed.origin().ascii_serialization(),
        well_known::RECOVERY_VERIFICATION_PATH
    ))
}

pub struct RecoveryService {
    repository: Arc<dyn AgentRepository>,
    credentials: Arc<CredentialStore>,
    validator: UrlSafetyValidator,
    fetcher: Arc<dyn OutboundFetcher>,
    clock: Arc<dyn Clock>,
    challenge_ttl: chrono::Duration,
    allow_private: bool,
}

impl RecoveryService {
    #[must_use]
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        credentials: Arc<CredentialStore>,
        validator: UrlSafetyValidator,
        fetcher: Arc<dyn OutboundFetcher>,
        clock: Arc<dyn Clock>,
        challenge_ttl_seconds: u64,
        allow_private: bool,
    ) -> Self {
        let ttl = i64::try_from(challenge_ttl_seconds).unwrap_or(i64::MAX);
        Self {
            repository,
            credentials,
            validator,
            fetcher,
            clock,
            challenge_ttl: chrono::Duration::try_seconds(ttl).unwrap_or(chrono::Duration::MAX),
            allow_private,
        }
    }

    /// Issue a fresh challenge, superseding any earlier one.
    pub async fn start(&self, id: AgentId) -> Result<RecoveryStart, RecoveryError> {
        let identity = self
            .repository
            .get(id)
            .await
            .map_err(RecoveryError::Storage)?
            .ok_or(RecoveryError::NotFound)?;
        let verification_url = verification_url(&identity.url).map_err(RecoveryError::UnsafeTarget)?;

        let challenge_token = generate_secret();
        let session_secret = generate_secret();
        let created_at = self.clock.now();
        let expires_at = created_at
            .checked_add_signed(self.challenge_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let challenge = RecoveryChallenge {
            challenge_hash: sha256_hex(&challenge_token),
            session_fingerprint: self.credentials.fingerprint(&session_secret),
            created_at,
            expires_at,
        };
        match self
            .repository
            .store_challenge(id, challenge)
            .await
            .map_err(RecoveryError::Storage)?
        {
            WriteOutcome::Applied => {}
            WriteOutcome::NotFound | WriteOutcome::Conflict => return Err(RecoveryError::NotFound),
        }

        tracing::info!(agent_id = %id, %expires_at, "recovery challenge issued");
        Ok(RecoveryStart {
            challenge_token,
            session_secret,
            verification_url,
            expires_at,
        })
    }

    /// Verify the published token and the session, then rotate the owner key.
    pub async fn complete(
        &self,
        id: AgentId,
        new_api_key: &str,
        session_secret: &str,
    ) -> Result<(), RecoveryError> {
        if new_api_key.trim().is_empty() {
            return Err(RecoveryError::InvalidNewCredential);
        }
        let identity = self
            .repository
            .get(id)
            .await
            .map_err(RecoveryError::Storage)?
            .ok_or(RecoveryError::NotFound)?;
        let session_fingerprint = self.credentials.fingerprint(session_secret);
        let now = self.clock.now();

        let Some(challenge) = identity.active_challenge(now).cloned() else {
            let replayed = identity
                .consumed_recovery_session
                .as_deref()
                .is_some_and(|consumed| constant_time_eq(consumed, &session_fingerprint));
            return Err(if replayed {
                RecoveryError::AlreadyConsumed
            } else {
                RecoveryError::NoActiveOrExpiredChallenge
            });
        };
        // Checked before any outbound request is made on the caller's behalf.
        if !constant_time_eq(&session_fingerprint, &challenge.session_fingerprint) {
            tracing::warn!(agent_id = %id, "recovery session mismatch");
            return Err(RecoveryError::SessionMismatch);
        }

        let url = verification_url(&identity.url).map_err(RecoveryError::UnsafeTarget)?;
        let target = self
            .validator
            .validate_for_outbound(&url, self.allow_private)
            .await
            .map_err(|e| match e {
                SafetyError::Unresolvable { host } => {
                    RecoveryError::VerificationUnreachable(format!("{host} did not resolve"))
                }
                other => RecoveryError::UnsafeTarget(other),
            })?;
        let response = self
            .fetcher
            .get(&url, target)
            .await
            .map_err(|e| RecoveryError::VerificationUnreachable(e.to_string()))?;
        if !response.is_success() {
            return Err(RecoveryError::VerificationUnreachable(format!(
                "status {}",
                response.status
            )));
        }

        let published = response.text();
        if !constant_time_eq(&sha256_hex(published.trim()), &challenge.challenge_hash) {
            tracing::warn!(agent_id = %id, "recovery verification token mismatch");
            return Err(RecoveryError::ChallengeMismatch);
        }

        let new_hash = self.credentials.hash_detached(new_api_key).await?;
        match self
            .repository
            .consume_challenge(id, &challenge, new_hash.into_string())
            .await
            .map_err(RecoveryError::Storage)?
        {
            WriteOutcome::Applied => {
                tracing::info!(agent_id = %id, "owner credential rotated via recovery");
                Ok(())
            }
            WriteOutcome::Conflict => {
                tracing::warn!(agent_id = %id, "recovery challenge lost the consumption race");
                Err(RecoveryError::AlreadyConsumed)
            }
            WriteOutcome::NotFound => Err(RecoveryError::NotFound),
        }
    }
}
