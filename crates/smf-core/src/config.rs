use crate::dn::{validate_dn, UnitClass};
use crate::error::{Result, SmfError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "smf.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// CommandTemplates
// ---------------------------------------------------------------------------

/// Shell command templates used by `ShellAgent`.
///
/// Placeholders: `{dn}` (unit), `{node}`, `{bundle}`, `{phase}`. A missing
/// template means the operation is a no-op that always succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instantiate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot: Option<String>,
    /// Polled until it exits 0 or the reboot timeout expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchover: Option<String>,
}

impl CommandTemplates {
    fn entries(&self) -> Vec<(&'static str, &Option<String>)> {
        vec![
            ("lock", &self.lock),
            ("unlock", &self.unlock),
            ("terminate", &self.terminate),
            ("instantiate", &self.instantiate),
            ("restart", &self.restart),
            ("online_install", &self.online_install),
            ("online_remove", &self.online_remove),
            ("offline_install", &self.offline_install),
            ("offline_remove", &self.offline_remove),
            ("maintenance", &self.maintenance),
            ("reboot", &self.reboot),
            ("node_up", &self.node_up),
            ("activation_hook", &self.activation_hook),
            ("switchover", &self.switchover),
        ]
    }
}

// ---------------------------------------------------------------------------
// SmfConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmfConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// DN of the node this orchestrator instance runs on.
    pub node: String,
    /// Cluster-wide switch selecting the activation-hook variants of the
    /// step sequences.
    #[serde(default)]
    pub activation_hook: bool,
    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_secs: u64,
    #[serde(default = "default_bundle_timeout")]
    pub bundle_timeout_secs: u64,
    #[serde(default = "default_store_path")]
    pub store: PathBuf,
    #[serde(default)]
    pub commands: CommandTemplates,
}

fn default_version() -> u32 {
    1
}

fn default_reboot_timeout() -> u64 {
    600
}

fn default_bundle_timeout() -> u64 {
    300
}

fn default_store_path() -> PathBuf {
    PathBuf::from("smf.db")
}

impl SmfConfig {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            version: 1,
            node: node.into(),
            activation_hook: false,
            reboot_timeout_secs: default_reboot_timeout(),
            bundle_timeout_secs: default_bundle_timeout(),
            store: default_store_path(),
            commands: CommandTemplates::default(),
        }
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }

    pub fn bundle_timeout(&self) -> Duration {
        Duration::from_secs(self.bundle_timeout_secs)
    }

    /// Store path, resolved against the directory holding the config file.
    pub fn store_path(&self, config_dir: &Path) -> PathBuf {
        if self.store.is_absolute() {
            self.store.clone()
        } else {
            config_dir.join(&self.store)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SmfError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config not found: {}", path.display()),
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: SmfConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if validate_dn(&self.node).is_err() || UnitClass::of(&self.node) != Some(UnitClass::Node) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("node '{}' is not a node DN", self.node),
            });
        }

        if self.reboot_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "reboot_timeout_secs must be greater than zero".to_string(),
            });
        }

        if self.bundle_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "bundle_timeout_secs must be greater than zero".to_string(),
            });
        }

        if self.activation_hook && self.commands.activation_hook.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "activation_hook is enabled but commands.activation_hook is not set; \
                          units will not be activated"
                    .to_string(),
            });
        }

        if self.commands.reboot.is_some() && self.commands.node_up.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "commands.reboot is set without commands.node_up; reboots will not \
                          wait for the node to rejoin"
                    .to_string(),
            });
        }

        for (name, template) in self.commands.entries() {
            if let Some(t) = template {
                if t.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("commands.{name} is empty"),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
