//! Storage port for agent identities.
//!
//! The conditional writes (`replace_owner_hash`, `consume_challenge`) are the
//! compare-and-swap primitives the credential and recovery flows rely on: an
//! implementation must apply them atomically against the currently stored
//! record and report `Conflict` when the expectation no longer holds.

use std::collections::HashMap;

use agora_common::{AgentId, AgentIdentity, HealthRecord, ProbeOutcome, RecoveryChallenge};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("Agent with this URL already exists")]
    DuplicateUrl,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The record exists but no longer matches the expectation.
    Conflict,
    NotFound,
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, id: AgentId) -> Result<Option<AgentIdentity>, RepositoryError>;

    async fn find_by_url(&self, url: &str) -> Result<Option<AgentIdentity>, RepositoryError>;

    /// Fails with [`RepositoryError::DuplicateUrl`] when the URL is taken.
    async fn insert(&self, identity: AgentIdentity) -> Result<(), RepositoryError>;

    /// Swap the owner hash only if it still equals `expected`.
    async fn replace_owner_hash(
        &self,
        id: AgentId,
        expected: &str,
        new_hash: String,
    ) -> Result<WriteOutcome, RepositoryError>;

    /// Install a recovery challenge, superseding any previous one.
    async fn store_challenge(
        &self,
        id: AgentId,
        challenge: RecoveryChallenge,
    ) -> Result<WriteOutcome, RepositoryError>;

    /// If the stored challenge still has `expected`'s hash and session
    /// fingerprint: set the new owner hash, clear the challenge, and remember
    /// the consumed session. All or nothing.
    async fn consume_challenge(
        &self,
        id: AgentId,
        expected: &RecoveryChallenge,
        new_owner_hash: String,
    ) -> Result<WriteOutcome, RepositoryError>;

    /// Apply one probe outcome to the stored health record.
    /// `None` when the agent no longer exists.
    async fn apply_probe_outcome(
        &self,
        id: AgentId,
        outcome: ProbeOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<HealthRecord>, RepositoryError>;

    /// The subset of `ids` that still exist, in the order given.
    async fn agents_to_probe(&self, ids: &[AgentId]) -> Result<Vec<AgentIdentity>, RepositoryError>;
}

#[derive(Debug, Default)]
struct Tables {
    agents: HashMap<AgentId, AgentIdentity>,
    by_url: HashMap<String, AgentId>,
}

/// Process-local repository. Every conditional write runs under one write lock.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an agent. Probe cycles count later lookups as skipped.
    pub fn remove(&self, id: AgentId) -> Option<AgentIdentity> {
        let mut tables = self.tables.write();
        let removed = tables.agents.remove(&id)?;
        tables.by_url.remove(&removed.url);
        Some(removed)
    }
}

#[async_trait]
impl AgentRepository for MemoryRepository {
    async fn get(&self, id: AgentId) -> Result<Option<AgentIdentity>, RepositoryError> {
        Ok(self.tables.read().agents.get(&id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<AgentIdentity>, RepositoryError> {
        let tables = self.tables.read();
        Ok(tables
            .by_url
            .get(url)
            .and_then(|id| tables.agents.get(id))
            .cloned())
    }

    async fn insert(&self, identity: AgentIdentity) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        if tables.by_url.contains_key(&identity.url) {
            return Err(RepositoryError::DuplicateUrl);
        }
        tables.by_url.insert(identity.url.clone(), identity.id);
        tables.agents.insert(identity.id, identity);
        Ok(())
    }

    async fn replace_owner_hash(
        &self,
        id: AgentId,
        expected: &str,
        new_hash: String,
    ) -> Result<WriteOutcome, RepositoryError> {
        let mut tables = self.tables.write();
        let Some(agent) = tables.agents.get_mut(&id) else {
            return Ok(WriteOutcome::NotFound);
        };
        if agent.owner_key_hash.as_deref() != Some(expected) {
            return Ok(WriteOutcome::Conflict);
        }
        agent.owner_key_hash = Some(new_hash);
        Ok(WriteOutcome::Applied)
    }

    async fn store_challenge(
        &self,
        id: AgentId,
        challenge: RecoveryChallenge,
    ) -> Result<WriteOutcome, RepositoryError> {
        let mut tables = self.tables.write();
        let Some(agent) = tables.agents.get_mut(&id) else {
            return Ok(WriteOutcome::NotFound);
        };
        agent.recovery = Some(challenge);
        Ok(WriteOutcome::Applied)
    }

    async fn consume_challenge(
        &self,
        id: AgentId,
        expected: &RecoveryChallenge,
        new_owner_hash: String,
    ) -> Result<WriteOutcome, RepositoryError> {
        let mut tables = self.tables.write();
        let Some(agent) = tables.agents.get_mut(&id) else {
            return Ok(WriteOutcome::NotFound);
        };
        let still_current = agent.recovery.as_ref().is_some_and(|current| {
            current.challenge_hash == expected.challenge_hash
                && current.session_fingerprint == expected.session_fingerprint
        });
        if !still_current {
            return Ok(WriteOutcome::Conflict);
        }
        agent.owner_key_hash = Some(new_owner_hash);
        agent.recovery = None;
        agent.consumed_recovery_session = Some(expected.session_fingerprint.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn apply_probe_outcome(
        &self,
        id: AgentId,
        outcome: ProbeOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<HealthRecord>, RepositoryError> {
        let mut tables = self.tables.write();
        Ok(tables.agents.get_mut(&id).map(|agent| {
            agent.health = agent.health.apply(outcome, at);
            agent.health
        }))
    }

    async fn agents_to_probe(&self, ids: &[AgentId]) -> Result<Vec<AgentIdentity>, RepositoryError> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.agents.get(id).cloned())
            .collect())
    }
}
