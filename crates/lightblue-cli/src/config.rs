//! LightBlue CLI configuration
//!
//! An optional TOML file supplies the lifecycle manager settings and a default
//! Bean to talk to. Command line options override the file.

use std::path::Path;

use lightblue_core::LightBlueConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

/// Complete configuration for the LightBlue CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Lifecycle manager settings
    pub lightblue: LightBlueConfig,

    /// Bean name used when `--name` is not given
    pub default_name: Option<String>,

    /// Bean address used when `--address` is not given
    pub default_address: Option<String>,
}

impl CliConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
