// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};
use crate::manifest::Requirement;

/// The three catalog kinds the registry publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum ModuleKind {
    Adapter,
    Driver,
    Plugin,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [ModuleKind::Adapter, ModuleKind::Driver, ModuleKind::Plugin];

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Adapter => "adapter",
            ModuleKind::Driver => "driver",
            ModuleKind::Plugin => "plugin",
        }
    }

    /// File stem used by the registry and the on-disk cache (`adapters`, ...).
    pub fn plural(self) -> &'static str {
        match self {
            ModuleKind::Adapter => "adapters",
            ModuleKind::Driver => "drivers",
            ModuleKind::Plugin => "plugins",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "adapter" | "adapters" => Ok(ModuleKind::Adapter),
            "driver" | "drivers" => Ok(ModuleKind::Driver),
            "plugin" | "plugins" => Ok(ModuleKind::Plugin),
            other => Err(format!("unknown module kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub color: String,
}

/// Result of the registry's own test run for a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Unknown,
    Passing,
    Failing,
}

/// One adapter, driver or plugin as published by the registry.
///
/// Two descriptors are equal when they name the same distribution and import
/// path; the remaining metadata is informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    /// Dotted import path, e.g. `nonebot.adapters.onebot.v11`.
    pub module_name: String,
    /// Distribution name on PyPI. Empty for local modules.
    pub project_link: String,
    pub name: String,
    pub desc: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub is_official: bool,
    /// ISO-8601 timestamp of the last registry update.
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub version: String,
    /// Plugins only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    /// Plugins only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_test: Option<bool>,
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.project_link == other.project_link && self.module_name == other.module_name
    }
}

impl Eq for Package {}

impl Package {
    /// A module that lives in the project itself rather than a distribution.
    pub fn local(name: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_name: module_name.into(),
            ..Self::default()
        }
    }

    pub fn is_local(&self) -> bool {
        self.project_link.is_empty()
    }

    pub fn validity(&self) -> Validity {
        match self.valid {
            None => Validity::Unknown,
            Some(true) => Validity::Passing,
            Some(false) => Validity::Failing,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.time).ok()
    }

    /// Requirement used to install this package: `dist>=version` unless
    /// `restrict_version` is off or no version is known.
    pub fn requirement(&self, restrict_version: bool) -> Result<Requirement> {
        if self.is_local() {
            return Err(CliError::InvalidRequirement {
                input: self.module_name.clone(),
                reason: "local modules have no distribution".to_string(),
            });
        }
        if restrict_version && !self.version.is_empty() {
            format!("{}>={}", self.project_link, self.version).parse()
        } else {
            self.project_link.parse()
        }
    }

    /// Case-insensitive match of `query` against the searchable fields.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        [&self.name, &self.module_name, &self.project_link, &self.desc]
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLUGIN_JSON: &str = r##"{
        "module_name": "nonebot_plugin_status",
        "project_link": "nonebot-plugin-status",
        "name": "Server status",
        "desc": "Check server status",
        "author": "yanyongyu",
        "homepage": "https://github.com/nonebot/plugin-status",
        "tags": [{"label": "server", "color": "#aeeaa8"}],
        "is_official": true,
        "time": "2023-04-01T12:30:00.123456Z",
        "version": "0.8.1",
        "valid": true,
        "skip_test": false
    }"##;

    #[test]
    fn parses_plugin_descriptor() {
        let pkg: Package = serde_json::from_str(PLUGIN_JSON).unwrap();
        assert_eq!(pkg.project_link, "nonebot-plugin-status");
        assert_eq!(pkg.tags.len(), 1);
        assert_eq!(pkg.validity(), Validity::Passing);
        assert!(pkg.updated_at().is_some());
    }

    #[test]
    fn adapter_descriptor_has_unknown_validity() {
        let pkg: Package = serde_json::from_str(
            r#"{"module_name": "nonebot.adapters.onebot.v11",
                "project_link": "nonebot-adapter-onebot",
                "name": "OneBot V11", "desc": "OneBot protocol"}"#,
        )
        .unwrap();
        assert_eq!(pkg.validity(), Validity::Unknown);
        assert!(!pkg.is_official);
    }

    #[test]
    fn equality_ignores_metadata() {
        let a: Package = serde_json::from_str(PLUGIN_JSON).unwrap();
        let mut b = a.clone();
        b.version = "9.9.9".to_string();
        b.desc.clear();
        assert_eq!(a, b);

        b.module_name = "other".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn requirement_pins_minimum_version() {
        let pkg: Package = serde_json::from_str(PLUGIN_JSON).unwrap();
        assert_eq!(
            pkg.requirement(true).unwrap().to_string(),
            "nonebot-plugin-status>=0.8.1"
        );
        assert_eq!(pkg.requirement(false).unwrap().to_string(), "nonebot-plugin-status");
        assert!(Package::local("x", "src.x").requirement(true).is_err());
    }

    #[test]
    fn query_matches_any_searchable_field() {
        let pkg: Package = serde_json::from_str(PLUGIN_JSON).unwrap();
        assert!(pkg.matches("STATUS"));
        assert!(pkg.matches("check server"));
        assert!(!pkg.matches("yanyongyu"));
    }
}
