//! Config pull and validation
//!
//! A single worker task owns the pull queue, so back-to-back pushes are
//! processed serially and the final acknowledged state always reflects the
//! most recently pulled configuration. Validation runs out-of-band from the
//! heartbeat loop: the result is sent as an explicit `config:ack` and kept in
//! shared state for subsequent heartbeats.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use fleet_core::config::{
    config_version, ConfigState, ConfigValidation, ValidationCategory, ValidationStatus,
};
use fleet_core::protocol::NodeFrame;

use crate::error::{AgentError, Result};
use crate::skills::SkillSet;

/// Per-category validation timeout
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Last validated config state, shared with the heartbeat loop
pub type SharedConfigState = Arc<RwLock<Option<ConfigState>>>;

/// Pulls the authoritative configuration from the gateway
pub struct ConfigPuller {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl ConfigPuller {
    pub fn new(url: String, token: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url,
            token,
        }
    }

    pub async fn pull(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AgentError::ConfigPull(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::ConfigPull(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AgentError::ConfigPull(format!("invalid payload: {}", e)))
    }
}

/// Spawn the serial pull worker; returns the trigger used on `config:push`
pub fn spawn_worker(
    puller: ConfigPuller,
    skills: SkillSet,
    outbound: mpsc::Sender<NodeFrame>,
    shared: SharedConfigState,
) -> mpsc::Sender<()> {
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(8);

    tokio::spawn(async move {
        while trigger_rx.recv().await.is_some() {
            let config = match puller.pull().await {
                Ok(config) => config,
                Err(e) => {
                    // No ack on a failed pull; the gateway's pending state
                    // stays visible instead of being papered over.
                    warn!("Config pull failed: {}", e);
                    continue;
                }
            };

            let state = validate_config(&config, &skills).await;
            info!(
                "Config validated: version {} ({} categories)",
                state.config_version,
                state.validations.len()
            );

            *shared.write().await = Some(state.clone());
            let _ = outbound
                .send(NodeFrame::ConfigAck {
                    config_state: state,
                })
                .await;
        }
    });

    trigger_tx
}

/// Validate a pulled configuration
///
/// Categories run concurrently, each under its own timeout; one failing
/// category never marks another as failed. A category whose section is absent
/// from the configuration is omitted from the report (implicitly unchecked).
pub async fn validate_config(config: &serde_json::Value, skills: &SkillSet) -> ConfigState {
    let version = config_version(config);

    let checks = ValidationCategory::ALL.iter().map(|category| async move {
        match tokio::time::timeout(CHECK_TIMEOUT, validate_category(*category, config, skills))
            .await
        {
            Ok(result) => result,
            Err(_) => Some(ConfigValidation {
                category: *category,
                status: ValidationStatus::Failed,
                message: Some("validation timed out".to_string()),
                checked_at: Utc::now(),
            }),
        }
    });

    let validations = futures::future::join_all(checks)
        .await
        .into_iter()
        .flatten()
        .collect();

    ConfigState {
        config_version: version,
        last_config_pull_at: Utc::now(),
        validations,
    }
}

async fn validate_category(
    category: ValidationCategory,
    config: &serde_json::Value,
    skills: &SkillSet,
) -> Option<ConfigValidation> {
    let section = config.get(section_key(category))?;

    let (status, message) = match category {
        ValidationCategory::LlmKeys => check_llm_keys(section),
        ValidationCategory::Oauth => check_oauth(section),
        ValidationCategory::EnvSecrets => check_env_secrets(section),
        ValidationCategory::Skills => check_skills(section, skills),
        ValidationCategory::BinaryDeps => check_binary_deps(section),
    };

    Some(ConfigValidation {
        category,
        status,
        message,
        checked_at: Utc::now(),
    })
}

fn section_key(category: ValidationCategory) -> &'static str {
    match category {
        ValidationCategory::LlmKeys => "llmKeys",
        ValidationCategory::Oauth => "oauth",
        ValidationCategory::EnvSecrets => "envSecrets",
        ValidationCategory::Skills => "skills",
        ValidationCategory::BinaryDeps => "binaryDeps",
    }
}

fn check_llm_keys(section: &serde_json::Value) -> (ValidationStatus, Option<String>) {
    let Some(keys) = section.as_object() else {
        return (
            ValidationStatus::Failed,
            Some("llmKeys must be an object".to_string()),
        );
    };

    let empty: Vec<&str> = keys
        .iter()
        .filter(|(_, value)| value.as_str().map_or(true, str::is_empty))
        .map(|(name, _)| name.as_str())
        .collect();

    if empty.is_empty() {
        (ValidationStatus::Verified, None)
    } else {
        (
            ValidationStatus::Failed,
            Some(format!("empty or invalid keys: {}", empty.join(", "))),
        )
    }
}

fn check_oauth(section: &serde_json::Value) -> (ValidationStatus, Option<String>) {
    let Some(providers) = section.as_object() else {
        return (
            ValidationStatus::Failed,
            Some("oauth must be an object".to_string()),
        );
    };

    let missing: Vec<&str> = providers
        .iter()
        .filter(|(_, grant)| {
            let has_token = grant
                .get("refreshToken")
                .and_then(|v| v.as_str())
                .map_or(false, |s| !s.is_empty());
            let has_file = grant
                .get("credentialFile")
                .and_then(|v| v.as_str())
                .map_or(false, |p| std::path::Path::new(p).exists());
            !has_token && !has_file
        })
        .map(|(name, _)| name.as_str())
        .collect();

    if missing.is_empty() {
        (ValidationStatus::Verified, None)
    } else {
        (
            ValidationStatus::Failed,
            Some(format!("no usable grant for: {}", missing.join(", "))),
        )
    }
}

fn check_env_secrets(section: &serde_json::Value) -> (ValidationStatus, Option<String>) {
    let Some(names) = section.as_array() else {
        return (
            ValidationStatus::Failed,
            Some("envSecrets must be an array of variable names".to_string()),
        );
    };

    let missing: Vec<String> = names
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| std::env::var(name).map(|v| v.is_empty()).unwrap_or(true))
        .map(String::from)
        .collect();

    if missing.is_empty() {
        (ValidationStatus::Verified, None)
    } else {
        (
            ValidationStatus::Failed,
            Some(format!("unset variables: {}", missing.join(", "))),
        )
    }
}

fn check_skills(section: &serde_json::Value, skills: &SkillSet) -> (ValidationStatus, Option<String>) {
    let Some(ids) = section.as_array() else {
        return (
            ValidationStatus::Failed,
            Some("skills must be an array of skill ids".to_string()),
        );
    };

    let unknown: Vec<&str> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|id| !skills.knows(id))
        .collect();
    if !unknown.is_empty() {
        return (
            ValidationStatus::Failed,
            Some(format!("unknown skills: {}", unknown.join(", "))),
        );
    }

    let reports = skills.probe_all();
    let unavailable: Vec<&str> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|id| {
            reports
                .iter()
                .find(|r| r.skill_id == *id)
                .map_or(true, |r| !r.available())
        })
        .collect();

    if unavailable.is_empty() {
        (ValidationStatus::Verified, None)
    } else {
        (
            ValidationStatus::Failed,
            Some(format!("unavailable skills: {}", unavailable.join(", "))),
        )
    }
}

fn check_binary_deps(section: &serde_json::Value) -> (ValidationStatus, Option<String>) {
    let Some(names) = section.as_array() else {
        return (
            ValidationStatus::Failed,
            Some("binaryDeps must be an array of binary names".to_string()),
        );
    };

    let missing: Vec<&str> = names
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| which::which(name).is_err())
        .collect();

    if missing.is_empty() {
        (ValidationStatus::Verified, None)
    } else {
        (
            ValidationStatus::Failed,
            Some(format!("missing binaries: {}", missing.join(", "))),
        )
    }
}
