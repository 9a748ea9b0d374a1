// SPDX-License-Identifier: GPL-3.0-or-later

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::{DEFAULT_MIRRORS, RegistryClient};

const APP_NAME: &str = "nb-cli";

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "NB_CLI_CONFIG";
/// Overrides the registry cache directory.
pub const CACHE_DIR_ENV: &str = "NB_CLI_CACHE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Detect a virtual environment inside the project root when no
    /// interpreter is given explicitly.
    pub auto_venv: bool,
    pub registry: RegistryConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// URL templates raced against each other; `{kind}` is replaced by
    /// `adapter`, `driver` or `plugin`.
    pub mirrors: Vec<String>,
    pub cache_max_age_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    pub delay_ms: u64,
    pub dirs: Vec<PathBuf>,
    pub dirs_excludes: Vec<PathBuf>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_venv: true,
            registry: RegistryConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mirrors: DEFAULT_MIRRORS.iter().map(|m| m.to_string()).collect(),
            cache_max_age_hours: 12,
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            delay_ms: 500,
            dirs: Vec::new(),
            dirs_excludes: Vec::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl ReloadConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = ProjectDirs::from("", "", APP_NAME)
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Root of the registry cache: `%LOCALAPPDATA%/nb-cli/Cache` on
    /// Windows, `~/Library/Caches/nb-cli` on macOS and
    /// `$XDG_CACHE_HOME/nb-cli` elsewhere.
    pub fn cache_dir() -> Result<PathBuf> {
        if let Some(path) = env::var_os(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = BaseDirs::new().context("Could not determine cache directory")?;
        let root = dirs.cache_dir().join(APP_NAME);
        if cfg!(windows) {
            Ok(root.join("Cache"))
        } else {
            Ok(root)
        }
    }

    pub fn registry_client(&self) -> Result<RegistryClient> {
        self.registry.check_mirrors()?;
        let cache_dir = Self::cache_dir()?;
        RegistryClient::new(self.registry.mirrors.clone(), cache_dir, self.registry.max_age())
            .context("Failed to build the registry client")
    }
}

impl RegistryConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_hours.saturating_mul(3600))
    }

    /// Reject an empty mirror list and warn when nothing can take over from
    /// a single failing mirror.
    pub fn check_mirrors(&self) -> Result<()> {
        match self.mirrors.len() {
            0 => bail!("No registry mirrors configured; set [registry] mirrors in the config file"),
            1 => {
                warn!(mirror = %self.mirrors[0], "only one registry mirror configured");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
