use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use stash_jobs::SchedulerConfig;
use stash_node::NodeConfig;
use stash_types::MaterialCatalog;

use crate::error::RegistryResult;

/// Configuration for the [`StorageNetworkRegistry`](crate::StorageNetworkRegistry).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Fall back to other regions when the requested one has no supply.
    pub cross_region_lookup: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cross_region_lookup: true,
        }
    }
}

/// Complete configuration for a stash deployment.
///
/// Every section is optional in the TOML file:
///
/// ```toml
/// [scheduler]
/// workers = 4
///
/// [node]
/// reserved_target = 50
///
/// [node.target_overrides]
/// Gold = 10
///
/// [[materials]]
/// id = "Gold"
/// stack_limit = 500
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    pub scheduler: SchedulerConfig,
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub materials: MaterialCatalog,
}

impl StashConfig {
    pub fn from_toml_str(s: &str) -> RegistryResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> RegistryResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from `path`.
    pub fn load(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> RegistryResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
