//! Configuration state, per-category validation, and content-hash versioning
//!
//! The configuration "version" is a content hash over the canonicalized
//! applied configuration, never a timestamp: equal configurations always hash
//! identically, so staleness is detected by equality rather than recency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Categories a node validates after pulling configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    LlmKeys,
    Oauth,
    EnvSecrets,
    Skills,
    BinaryDeps,
}

impl ValidationCategory {
    /// All categories a complete validation run covers
    pub const ALL: [Self; 5] = [
        Self::LlmKeys,
        Self::Oauth,
        Self::EnvSecrets,
        Self::Skills,
        Self::BinaryDeps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmKeys => "llm_keys",
            Self::Oauth => "oauth",
            Self::EnvSecrets => "env_secrets",
            Self::Skills => "skills",
            Self::BinaryDeps => "binary_deps",
        }
    }
}

/// Outcome of validating one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Verified,
    Failed,
    Unchecked,
}

/// Validation result for a single category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidation {
    pub category: ValidationCategory,
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// The node's report of what configuration is actually applied and working
///
/// Owned by the node; the gateway only ever stores the last value it was told.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigState {
    /// Content hash of the applied configuration
    pub config_version: String,
    pub last_config_pull_at: DateTime<Utc>,
    pub validations: Vec<ConfigValidation>,
}

impl ConfigState {
    /// Status for a category. A category absent from the report is
    /// `Unchecked`, never implicitly `Verified`.
    pub fn validation_status(&self, category: ValidationCategory) -> ValidationStatus {
        self.validations
            .iter()
            .find(|v| v.category == category)
            .map(|v| v.status)
            .unwrap_or(ValidationStatus::Unchecked)
    }
}

/// Gateway-side view of the push/validate/acknowledge handshake for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSyncStatus {
    /// No push has been attempted and no state has been reported
    Unknown,
    /// A push was delivered; the acknowledgement is outstanding
    PendingValidation,
    /// Every category in the acknowledgement verified
    Verified,
    /// The acknowledgement carried a mix of outcomes
    PartiallyVerified,
    /// The push could not be delivered because the node was unreachable
    Failed,
}

/// Persisted sync state, stored per node as an opaque structured blob
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSyncState {
    pub status: ConfigSyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConfigState>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigSyncState {
    pub fn unknown() -> Self {
        Self {
            status: ConfigSyncStatus::Unknown,
            state: None,
            updated_at: Utc::now(),
        }
    }

    /// Derive the sync status from an acknowledged [`ConfigState`]
    pub fn from_ack(state: ConfigState) -> Self {
        let all_verified = ValidationCategory::ALL
            .iter()
            .all(|c| state.validation_status(*c) == ValidationStatus::Verified);
        let status = if all_verified {
            ConfigSyncStatus::Verified
        } else {
            ConfigSyncStatus::PartiallyVerified
        };
        Self {
            status,
            state: Some(state),
            updated_at: Utc::now(),
        }
    }
}

/// Compute the content-hash version of a configuration document
///
/// The document is canonicalized (object keys sorted recursively) before
/// hashing so key order in transit never changes the version.
pub fn config_version(config: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(config).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
