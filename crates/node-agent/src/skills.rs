//! Skill readiness probes
//!
//! Skills declare their probes in a manifest; the agent recomputes the full
//! check list on demand and ships it in every heartbeat, never a summary.
//! Failing probes carry the remediation action the dashboard renders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_core::skill::{ActionType, SkillCheck, SkillHealthCheck};

fn default_true() -> bool {
    true
}

/// A single declarative probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// An environment variable must be present and non-empty
    EnvVar {
        name: String,
        #[serde(default = "default_true")]
        required: bool,
    },
    /// A binary must be resolvable on PATH
    Binary {
        name: String,
        #[serde(default = "default_true")]
        required: bool,
    },
    /// Stored OAuth grant material must exist on disk
    CredentialFile {
        path: PathBuf,
        #[serde(default = "default_true")]
        required: bool,
    },
}

/// Manifest for one skill's readiness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillManifest {
    pub skill_id: String,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

/// The set of skills this node exposes
#[derive(Debug, Clone)]
pub struct SkillSet {
    manifests: Vec<SkillManifest>,
}

impl SkillSet {
    pub fn new(manifests: Vec<SkillManifest>) -> Self {
        Self { manifests }
    }

    /// Load manifests from a JSON file
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let manifests: Vec<SkillManifest> = serde_json::from_str(&content)?;
        Ok(Self { manifests })
    }

    /// Built-in default: a shell skill backed by `sh`
    pub fn builtin() -> Self {
        Self {
            manifests: vec![SkillManifest {
                skill_id: "shell".to_string(),
                probes: vec![ProbeSpec::Binary {
                    name: "sh".to_string(),
                    required: true,
                }],
            }],
        }
    }

    pub fn skill_ids(&self) -> Vec<String> {
        self.manifests.iter().map(|m| m.skill_id.clone()).collect()
    }

    pub fn knows(&self, skill_id: &str) -> bool {
        self.manifests.iter().any(|m| m.skill_id == skill_id)
    }

    /// Recompute every skill's health. Each call replaces the previous
    /// report wholesale.
    pub fn probe_all(&self) -> Vec<SkillHealthCheck> {
        self.manifests
            .iter()
            .map(|manifest| {
                let checks = manifest.probes.iter().map(run_probe).collect();
                debug!("Probed skill {}", manifest.skill_id);
                SkillHealthCheck {
                    skill_id: manifest.skill_id.clone(),
                    checks,
                }
            })
            .collect()
    }
}

fn run_probe(spec: &ProbeSpec) -> SkillCheck {
    match spec {
        ProbeSpec::EnvVar { name, required } => {
            let ok = std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
            SkillCheck {
                label: format!("env {}", name),
                required: *required,
                ok,
                action_type: ActionType::EnvSet,
                message: (!ok).then(|| format!("environment variable {} is not set", name)),
            }
        }
        ProbeSpec::Binary { name, required } => {
            let ok = which::which(name).is_ok();
            SkillCheck {
                label: format!("binary {}", name),
                required: *required,
                ok,
                action_type: ActionType::BinaryInstall,
                message: (!ok).then(|| format!("{} not found on PATH", name)),
            }
        }
        ProbeSpec::CredentialFile { path, required } => {
            let ok = path.exists();
            SkillCheck {
                label: format!("credentials {}", path.display()),
                required: *required,
                ok,
                action_type: ActionType::OauthConnect,
                message: (!ok).then(|| "stored grant is missing; reconnect the account".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_probe_finds_sh() {
        let skills = SkillSet::builtin();
        let reports = skills.probe_all();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].skill_id, "shell");
        assert!(reports[0].available());
    }

    #[test]
    fn test_missing_binary_fails_with_install_hint() {
        let skills = SkillSet::new(vec![SkillManifest {
            skill_id: "ghost".to_string(),
            probes: vec![ProbeSpec::Binary {
                name: "definitely-not-a-real-binary-xyz".to_string(),
                required: true,
            }],
        }]);

        let reports = skills.probe_all();
        assert!(!reports[0].available());
        assert_eq!(reports[0].checks[0].action_type, ActionType::BinaryInstall);
        assert!(reports[0].checks[0].message.is_some());
    }

    #[test]
    fn test_env_probe() {
        std::env::set_var("FLEET_TEST_PROBE_VAR", "set");
        let skills = SkillSet::new(vec![SkillManifest {
            skill_id: "env-skill".to_string(),
            probes: vec![
                ProbeSpec::EnvVar {
                    name: "FLEET_TEST_PROBE_VAR".to_string(),
                    required: true,
                },
                ProbeSpec::EnvVar {
                    name: "FLEET_TEST_PROBE_UNSET".to_string(),
                    required: false,
                },
            ],
        }]);

        let reports = skills.probe_all();
        // Required check passes, optional one fails without sinking the skill.
        assert!(reports[0].available());
        assert!(!reports[0].checks[1].ok);
    }

    #[tokio::test]
    async fn test_manifest_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("skills.json");
        let manifests = vec![SkillManifest {
            skill_id: "browser".to_string(),
            probes: vec![ProbeSpec::Binary {
                name: "chromium".to_string(),
                required: true,
            }],
        }];
        tokio::fs::write(&path, serde_json::to_string(&manifests).unwrap())
            .await
            .unwrap();

        let skills = SkillSet::load(&path).await.unwrap();
        assert_eq!(skills.skill_ids(), vec!["browser".to_string()]);
        assert!(skills.knows("browser"));
        assert!(!skills.knows("shell"));
    }
}
