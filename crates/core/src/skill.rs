//! Skill health checks and the availability verdict
//!
//! A node recomputes its skill health on demand and transmits the full check
//! list on every heartbeat. The aggregator turns raw per-check booleans into
//! an availability verdict plus remediation hints: a skill is available iff
//! every `required` check is ok; optional checks may fail without affecting
//! availability but are still surfaced with their action type.

use serde::{Deserialize, Serialize};

/// Remediation a caller can render for a failing check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "oauth-connect")]
    OauthConnect,
    #[serde(rename = "binary-install")]
    BinaryInstall,
    #[serde(rename = "env-set")]
    EnvSet,
    #[serde(rename = "none")]
    None,
}

/// A single readiness probe for a skill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillCheck {
    pub label: String,
    pub required: bool,
    pub ok: bool,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Full health report for one skill, as transmitted in heartbeats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillHealthCheck {
    pub skill_id: String,
    pub checks: Vec<SkillCheck>,
}

impl SkillHealthCheck {
    /// A skill is available iff every required check passed
    pub fn available(&self) -> bool {
        self.checks.iter().filter(|c| c.required).all(|c| c.ok)
    }
}

/// Aggregated verdict for display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillVerdict {
    pub skill_id: String,
    pub available: bool,
    /// Every failing check, required or optional, with its remediation hint
    pub remediations: Vec<Remediation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    pub label: String,
    pub required: bool,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Normalize raw reports into verdicts
pub fn aggregate(reports: &[SkillHealthCheck]) -> Vec<SkillVerdict> {
    reports
        .iter()
        .map(|report| SkillVerdict {
            skill_id: report.skill_id.clone(),
            available: report.available(),
            remediations: report
                .checks
                .iter()
                .filter(|check| !check.ok)
                .map(|check| Remediation {
                    label: check.label.clone(),
                    required: check.required,
                    action_type: check.action_type,
                    message: check.message.clone(),
                })
                .collect(),
        })
        .collect()
}
