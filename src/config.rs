//! Host configuration: where module binaries live and which instances to
//! bring up. Loaded from a JSON file, with `DECKHOST_*` environment
//! variables taking precedence (a `.env` file is honored when present).

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostError;
use module_plugin::message::ModuleKind;
use module_plugin::upgrades::MigrationRecord;

/// One configured integration, as persisted by whatever owns the config
/// store. The opaque `config` blob and the migration records pass through
/// the module's upgrade scripts on init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub kind: ModuleKind,
    /// Name of the module binary under the modules directory.
    pub module_id: String,
    /// Pinned module version; resolved to `<module_id>-<version>` on disk.
    #[serde(default)]
    pub requested_version: Option<String>,
    #[serde(default)]
    pub config: Value,
    /// Upgrade index the persisted config was written at.
    #[serde(default)]
    pub schema_version: Option<i64>,
    #[serde(default)]
    pub actions: HashMap<String, MigrationRecord>,
    #[serde(default)]
    pub feedbacks: HashMap<String, MigrationRecord>,
    /// Extra environment for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub modules_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl HostConfig {
    /// Read the instance file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: HostConfig = serde_json::from_str(&raw)
            .map_err(|err| HostError::Config(format!("{}: {err}", path.display())))?;

        if let Ok(dir) = env::var("DECKHOST_MODULES_DIR") {
            config.modules_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("DECKHOST_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HostError> {
        if !self.modules_dir.is_dir() {
            return Err(HostError::Config(format!(
                "modules_dir `{}` is not a directory",
                self.modules_dir.display()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.id.is_empty() {
                return Err(HostError::Config("instance with an empty id".into()));
            }
            if !seen.insert(&instance.id) {
                return Err(HostError::Config(format!(
                    "duplicate instance id `{}`",
                    instance.id
                )));
            }
        }
        Ok(())
    }
}
