//! Top-level error taxonomy and its transport mapping.
//!
//! Each component owns a typed error enum; `TrustError` aggregates them via
//! `#[from]` so callers can use `?` across component boundaries. The route
//! layer turns a `TrustError` into a response with the status the error kind
//! demands.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::normalize::NormalizationError;
use crate::rate_limit::RateLimitError;
use crate::recovery::RecoveryError;
use crate::repository::RepositoryError;
use crate::url_safety::SafetyError;

/// Any failure surfaced by the trust core to its callers.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    InvalidUrl(#[from] NormalizationError),

    #[error("Invalid or missing credential")]
    InvalidCredential,

    #[error("Agent not found")]
    NotFound,

    #[error("Agent with this URL already exists")]
    DuplicateUrl,

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Storage unavailable: {0}")]
    Storage(String),
}

impl From<RepositoryError> for TrustError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::DuplicateUrl => Self::DuplicateUrl,
            RepositoryError::Unavailable(reason) => Self::Storage(reason),
        }
    }
}

/// Closed set of error kinds the route layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsafeTarget,
    UnresolvableHost,
    InvalidUrl,
    InvalidCredential,
    NotFound,
    DuplicateUrl,
    NoActiveOrExpiredChallenge,
    VerificationUnreachable,
    ChallengeVerificationMismatch,
    SessionMismatch,
    ChallengeAlreadyConsumed,
    RateLimited,
    RateLimitBackendUnavailable,
    StorageUnavailable,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsafeTarget => "unsafe_target",
            Self::UnresolvableHost => "unresolvable_host",
            Self::InvalidUrl => "invalid_url",
            Self::InvalidCredential => "invalid_credential",
            Self::NotFound => "not_found",
            Self::DuplicateUrl => "duplicate_url",
            Self::NoActiveOrExpiredChallenge => "no_active_or_expired_challenge",
            Self::VerificationUnreachable => "verification_unreachable",
            Self::ChallengeVerificationMismatch => "challenge_verification_mismatch",
            Self::SessionMismatch => "session_mismatch",
            Self::ChallengeAlreadyConsumed => "challenge_already_consumed",
            Self::RateLimited => "rate_limited",
            Self::RateLimitBackendUnavailable => "rate_limit_backend_unavailable",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::UnsafeTarget
            | Self::UnresolvableHost
            | Self::InvalidUrl
            | Self::NoActiveOrExpiredChallenge
            | Self::VerificationUnreachable
            | Self::ChallengeVerificationMismatch
            | Self::SessionMismatch => StatusCode::BAD_REQUEST,
            Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateUrl | Self::ChallengeAlreadyConsumed => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::RateLimitBackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageUnavailable | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn safety_kind(err: &SafetyError) -> ErrorKind {
    match err {
        SafetyError::Unresolvable { .. } => ErrorKind::UnresolvableHost,
        SafetyError::InvalidUrl(_) => ErrorKind::InvalidUrl,
        SafetyError::MissingHost | SafetyError::UserInfo | SafetyError::BlockedTarget { .. } => {
            ErrorKind::UnsafeTarget
        }
    }
}

impl TrustError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Safety(err) => safety_kind(err),
            Self::InvalidUrl(NormalizationError::UserInfo | NormalizationError::MissingHost) => {
                ErrorKind::UnsafeTarget
            }
            Self::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Self::InvalidCredential => ErrorKind::InvalidCredential,
            Self::NotFound => ErrorKind::NotFound,
            Self::DuplicateUrl => ErrorKind::DuplicateUrl,
            Self::Recovery(err) => match err {
                RecoveryError::NotFound => ErrorKind::NotFound,
                RecoveryError::NoActiveOrExpiredChallenge => ErrorKind::NoActiveOrExpiredChallenge,
                RecoveryError::VerificationUnreachable(_) => ErrorKind::VerificationUnreachable,
                RecoveryError::UnsafeTarget(inner) => safety_kind(inner),
                RecoveryError::ChallengeMismatch => ErrorKind::ChallengeVerificationMismatch,
                RecoveryError::SessionMismatch => ErrorKind::SessionMismatch,
                RecoveryError::AlreadyConsumed => ErrorKind::ChallengeAlreadyConsumed,
                RecoveryError::InvalidNewCredential => ErrorKind::InvalidCredential,
                RecoveryError::Credential(_) => ErrorKind::Internal,
                RecoveryError::Storage(_) => ErrorKind::StorageUnavailable,
            },
            Self::RateLimit(err) => match err {
                RateLimitError::Limited { .. } => ErrorKind::RateLimited,
                RateLimitError::BackendUnavailable(_) => ErrorKind::RateLimitBackendUnavailable,
            },
            Self::Credential(_) => ErrorKind::Internal,
            Self::Storage(_) => ErrorKind::StorageUnavailable,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Seconds a throttled caller should wait, for the `Retry-After` header.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimit(RateLimitError::Limited {
                retry_after_seconds,
                ..
            }) => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

impl IntoResponse for TrustError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = kind.status_code();

        // Server-side failures carry operator detail; keep it in the logs.
        let message = if status.is_server_error() {
            tracing::error!(kind = kind.as_str(), error = %self, "trust core failure");
            match kind {
                ErrorKind::RateLimitBackendUnavailable => {
                    "Rate limiting is temporarily unavailable".to_string()
                }
                _ => "Internal error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = Json(serde_json::json!({
            "error": kind.as_str(),
            "message": message,
        }));

        match self.retry_after_seconds() {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}
