//! API-key hashing, verification, migration, and fingerprints.
//!
//! Stored hashes come in two shapes:
//!   - legacy: 64 lowercase hex chars, unsalted SHA-256 of the key
//!   - modern: an Argon2 PHC string (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`)
//!
//! Both verify. Legacy hashes and modern hashes with outdated parameters are
//! reported by [`CredentialStore::should_rehash`]; the caller re-hashes after a
//! successful verification.

use std::fmt;
use std::sync::Arc;

use agora_common::Settings;
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const LEGACY_HEX_LEN: usize = 64;
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("invalid argon2 parameters: {0}")]
    InvalidParams(String),

    #[error("invalid fingerprint key")]
    InvalidFingerprintKey,

    #[error("hashing failed: {0}")]
    Hashing(String),

    #[error("hashing worker failed: {0}")]
    Worker(String),
}

/// A stored credential hash, classified by shape.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialHash {
    Legacy(String),
    Modern(String),
}

impl CredentialHash {
    /// Classify a stored string. `None` when it is neither shape.
    #[must_use]
    pub fn parse(stored: &str) -> Option<Self> {
        if stored.starts_with("$argon2") {
            Some(Self::Modern(stored.to_string()))
        } else if stored.len() == LEGACY_HEX_LEN && stored.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self::Legacy(stored.to_ascii_lowercase()))
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Legacy(s) | Self::Modern(s) => s,
        }
    }

    #[must_use]
    pub fn into_string(self) -> String {
        match self {
            Self::Legacy(s) | Self::Modern(s) => s,
        }
    }

    #[must_use]
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = if self.is_legacy() { "Legacy" } else { "Modern" };
        write!(f, "CredentialHash::{variant}(..)")
    }
}

/// SHA-256 hex digest. Used for legacy credentials and for challenge tokens.
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Constant-time string equality. Lengths are hidden by comparing digests.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (Sha256::digest(a.as_bytes()), Sha256::digest(b.as_bytes()));
    a.as_slice().ct_eq(b.as_slice()).into()
}

/// Hashes and verifies API keys under the configured Argon2id parameters.
#[derive(Clone)]
pub struct CredentialStore {
    argon: Argon2<'static>,
    params: Params,
    fingerprint_mac: HmacSha256,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(settings: &Settings) -> Result<Self, CredentialError> {
        let params = Params::new(
            settings.argon2_memory_kib,
            settings.argon2_time_cost,
            settings.argon2_parallelism,
            None,
        )
        .map_err(|e| CredentialError::InvalidParams(e.to_string()))?;
        let fingerprint_mac = match settings.fingerprint_key.as_deref() {
            Some(key) => HmacSha256::new_from_slice(key.as_bytes()),
            None => {
                let mut key = [0u8; SECRET_BYTES];
                OsRng.fill_bytes(&mut key);
                HmacSha256::new_from_slice(&key)
            }
        }
        .map_err(|_| CredentialError::InvalidFingerprintKey)?;

        Ok(Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone()),
            params,
            fingerprint_mac,
        })
    }

    /// Salted Argon2id hash under the current parameters.
    pub fn hash(&self, secret: &str) -> Result<CredentialHash, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        let phc = self
            .argon
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;
        Ok(CredentialHash::Modern(phc.to_string()))
    }

    /// `false` for a missing or unrecognised stored hash.
    #[must_use]
    pub fn verify(&self, secret: &str, stored: Option<&str>) -> bool {
        match stored.and_then(CredentialHash::parse) {
            None => false,
            Some(CredentialHash::Legacy(hex_digest)) => {
                let provided = sha256_hex(secret);
                provided.as_bytes().ct_eq(hex_digest.as_bytes()).into()
            }
            // Argon2 verifies with the parameters embedded in the hash and
            // compares the output in constant time.
            Some(CredentialHash::Modern(phc)) => PasswordHash::new(&phc)
                .is_ok_and(|parsed| self.argon.verify_password(secret.as_bytes(), &parsed).is_ok()),
        }
    }

    #[must_use]
    pub fn should_rehash(&self, stored: &str) -> bool {
        let Some(CredentialHash::Modern(phc)) = CredentialHash::parse(stored) else {
            return true;
        };
        let Ok(parsed) = PasswordHash::new(&phc) else {
            return true;
        };
        if parsed.algorithm != argon2::ARGON2ID_IDENT || parsed.version != Some(Version::V0x13.into())
        {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(embedded) => {
                embedded.m_cost() != self.params.m_cost()
                    || embedded.t_cost() != self.params.t_cost()
                    || embedded.p_cost() != self.params.p_cost()
            }
            Err(_) => true,
        }
    }

    /// Deterministic keyed identifier for rate-limit bucketing.
    ///
    /// HMAC-SHA256 under a dedicated key, so it differs from both hash shapes.
    /// Never logged.
    #[must_use]
    pub fn fingerprint(&self, secret: &str) -> String {
        let mut mac = self.fingerprint_mac.clone();
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Run [`Self::hash`] on the blocking pool.
    pub async fn hash_detached(self: &Arc<Self>, secret: &str) -> Result<CredentialHash, CredentialError> {
        let store = Arc::clone(self);
        let secret = secret.to_owned();
        tokio::task::spawn_blocking(move || store.hash(&secret))
            .await
            .map_err(|e| CredentialError::Worker(e.to_string()))?
    }

    /// Run [`Self::verify`] on the blocking pool.
    pub async fn verify_detached(
        self: &Arc<Self>,
        secret: &str,
        stored: Option<&str>,
    ) -> Result<bool, CredentialError> {
        let store = Arc::clone(self);
        let secret = secret.to_owned();
        let stored = stored.map(str::to_owned);
        tokio::task::spawn_blocking(move || store.verify(&secret, stored.as_deref()))
            .await
            .map_err(|e| CredentialError::Worker(e.to_string()))
    }
}

/// 256 random bits from the OS, base64url without padding.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Admin access requires a configured token and a matching presented one.
#[must_use]
pub fn verify_admin_token(presented: Option<&str>, configured: Option<&str>) -> bool {
    match (presented, configured) {
        (Some(p), Some(c)) if !c.is_empty() => constant_time_eq(p, c),
        _ => false,
    }
}
