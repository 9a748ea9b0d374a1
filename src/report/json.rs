// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::{ModuleKind, Package};

/// A JSON-serializable package listing.
#[derive(Serialize)]
pub struct JsonReport<'a> {
    pub generated_at: DateTime<Utc>,
    pub kind: &'static str,
    pub total_packages: usize,
    pub packages: &'a [Package],
}

pub fn render_json(kind: ModuleKind, packages: &[Package], timestamp: DateTime<Utc>) -> Result<String> {
    let report = JsonReport {
        generated_at: timestamp,
        kind: kind.as_str(),
        total_packages: packages.len(),
        packages,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Print a JSON listing to stdout.
pub fn print_json(kind: ModuleKind, packages: &[Package]) -> Result<()> {
    println!("{}", render_json(kind, packages, Utc::now())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_report_structure() {
        let packages = vec![Package {
            module_name: "nonebot_plugin_status".to_string(),
            project_link: "nonebot-plugin-status".to_string(),
            name: "Server status".to_string(),
            valid: Some(true),
            ..Package::default()
        }];
        let timestamp = "2025-01-15T10:30:00Z".parse::<DateTime<Utc>>().unwrap();

        let json = render_json(ModuleKind::Plugin, &packages, timestamp).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["kind"], "plugin");
        assert_eq!(parsed["total_packages"], 1);
        assert_eq!(parsed["generated_at"], "2025-01-15T10:30:00Z");
        assert_eq!(parsed["packages"][0]["project_link"], "nonebot-plugin-status");
        assert_eq!(parsed["packages"][0]["valid"], true);
    }

    #[test]
    fn empty_listing() {
        let timestamp = "2025-01-15T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let json = render_json(ModuleKind::Driver, &[], timestamp).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["total_packages"], 0);
        assert!(parsed["packages"].as_array().unwrap().is_empty());
    }
}
