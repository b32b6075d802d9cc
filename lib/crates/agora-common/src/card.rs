//! A2A Agent Card payload validation.
//!
//! The health prober only counts a probe as successful when the fetched body
//! is a card that passes these checks. Unknown fields are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redis_keys::limits::MAX_AGENT_URL_LENGTH;

pub const MAX_AGENT_NAME_LENGTH: usize = 255;
pub const MAX_AGENT_DESCRIPTION_LENGTH: usize = 4000;
pub const MAX_AGENT_VERSION_LENGTH: usize = 50;
pub const MAX_PROTOCOL_VERSION_LENGTH: usize = 20;
pub const MAX_SKILL_ID_LENGTH: usize = 255;
pub const MAX_SKILL_NAME_LENGTH: usize = 255;
pub const MAX_SKILL_DESCRIPTION_LENGTH: usize = 2000;

/// Subset of the A2A skill schema the registry reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCard {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Subset of the A2A Agent Card schema the registry reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    pub skills: Vec<SkillCard>,
}

#[derive(Debug, Error)]
pub enum CardError {
    #[error("Agent Card is not a valid card document: {0}")]
    Malformed(String),

    #[error("Agent Card field '{field}' is invalid: {message}")]
    Invalid { field: String, message: String },
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> CardError {
    CardError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

fn check_required(field: &str, value: &str, max: usize) -> Result<(), CardError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    check_max(field, trimmed, max)
}

fn check_max(field: &str, value: &str, max: usize) -> Result<(), CardError> {
    if value.trim().chars().count() > max {
        return Err(invalid(field, format!("must be at most {max} characters")));
    }
    Ok(())
}

/// `N.N.N` with ASCII digits only.
fn is_semver_triplet(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn is_http_url(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    let rest = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"));
    rest.is_some_and(|r| !r.is_empty() && !r.starts_with('/'))
}

/// Validate an Agent Card JSON payload.
pub fn validate_agent_card(payload: &serde_json::Value) -> Result<AgentCard, CardError> {
    let card: AgentCard = serde_json::from_value(payload.clone())
        .map_err(|e| CardError::Malformed(e.to_string()))?;

    let protocol_version = card.protocol_version.trim();
    check_max("protocolVersion", protocol_version, MAX_PROTOCOL_VERSION_LENGTH)?;
    if !is_semver_triplet(protocol_version) {
        return Err(invalid("protocolVersion", "must match N.N.N"));
    }

    check_required("name", &card.name, MAX_AGENT_NAME_LENGTH)?;
    if let Some(description) = &card.description {
        check_max("description", description, MAX_AGENT_DESCRIPTION_LENGTH)?;
    }
    if let Some(version) = &card.version {
        check_max("version", version, MAX_AGENT_VERSION_LENGTH)?;
    }

    let url = card.url.trim();
    if url.len() > MAX_AGENT_URL_LENGTH {
        return Err(invalid(
            "url",
            format!("must be at most {MAX_AGENT_URL_LENGTH} characters"),
        ));
    }
    if !is_http_url(url) {
        return Err(invalid("url", "must be an http or https URL"));
    }

    if card.skills.is_empty() {
        return Err(invalid("skills", "at least one skill is required"));
    }
    for (idx, skill) in card.skills.iter().enumerate() {
        check_required(&format!("skills.{idx}.id"), &skill.id, MAX_SKILL_ID_LENGTH)?;
        check_required(&format!("skills.{idx}.name"), &skill.name, MAX_SKILL_NAME_LENGTH)?;
        if let Some(description) = &skill.description {
            check_max(
                &format!("skills.{idx}.description"),
                description,
                MAX_SKILL_DESCRIPTION_LENGTH,
            )?;
        }
    }

    Ok(card)
}
