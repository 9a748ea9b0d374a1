// SPDX-License-Identifier: GPL-3.0-or-later

//! Project manifest (`pyproject.toml`) store.
//!
//! Every public operation is a full read-modify-write of the file performed
//! under a process-wide lock: the document is parsed, patched in memory and
//! written back in one piece, so the file on disk is always complete TOML.
//!
//! The `tool.nonebot` table exists in two layouts, see [`Policy`]. Callers
//! work with [`NoneBotConfig`] and never need to know which one is on disk,
//! except for the explicit [`ManifestStore::upgrade_format`] and
//! [`ManifestStore::downgrade_format`] migrations.

mod model;
mod policy;
mod requirement;

pub use model::{
    Buckets, GroupedConfig, LOCAL_BUCKET, LegacyConfig, NoneBotConfig, PluginRef, SimpleInfo,
};
pub use policy::Policy;
pub use requirement::Requirement;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use toml_edit::{DocumentMut, Item, Table, TableLike};
use tracing::{debug, warn};

use crate::error::{CliError, Result};
use crate::project::MANIFEST_FILE;
use crate::registry::Package;
use policy::{decode_list, decode_string, encode_string, patch_list};

static MANIFEST_LOCK: Mutex<()> = Mutex::new(());
static LEGACY_WARNING: Once = Once::new();

const DEPENDENCY_GROUPS: &str = "dependency-groups";

pub struct ManifestStore {
    path: PathBuf,
    policy: Mutex<Option<Policy>>,
}

impl ManifestStore {
    /// Store for the manifest at the root of `project_root`.
    pub fn new(project_root: &Path) -> Self {
        Self::at(project_root.join(MANIFEST_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout of `tool.nonebot`, probed once and cached until the next write.
    pub fn policy(&self) -> Result<Policy> {
        if let Some(policy) = *self.cached_policy() {
            return Ok(policy);
        }
        let _guard = lock();
        let doc = self.load()?;
        self.probe(&doc)
    }

    pub fn read(&self) -> Result<NoneBotConfig> {
        let _guard = lock();
        let doc = self.load()?;
        self.probe(&doc)?.decode(&doc)
    }

    /// Replace `tool.nonebot` with `config`. Nodes whose value is unchanged
    /// keep their formatting.
    pub fn write(&self, config: &NoneBotConfig) -> Result<()> {
        let _guard = lock();
        let mut doc = self.load()?;
        policy::apply(&mut doc, config)?;
        self.save(&doc)?;
        *self.cached_policy() = None;
        Ok(())
    }

    pub fn add_adapter(&self, pkg: &Package) -> Result<()> {
        self.edit_config(|config| config.add_adapter(pkg))
    }

    /// Remove an adapter. Returns whether its distribution is now unreferenced
    /// and may be uninstalled.
    pub fn remove_adapter(&self, pkg: &Package) -> Result<bool> {
        self.edit_config(|config| config.remove_adapter(pkg))
    }

    pub fn add_plugin<'a>(&self, plugin: impl Into<PluginRef<'a>>) -> Result<()> {
        let plugin = plugin.into();
        self.edit_config(|config| config.add_plugin(plugin))
    }

    /// Remove a plugin. Returns whether its distribution is now unreferenced.
    pub fn remove_plugin<'a>(&self, plugin: impl Into<PluginRef<'a>>) -> Result<bool> {
        let plugin = plugin.into();
        self.edit_config(|config| config.remove_plugin(plugin))
    }

    pub fn add_builtin_plugin(&self, name: &str) -> Result<()> {
        self.edit_config(|config| {
            let builtin = config.builtin_plugins_mut();
            if !builtin.iter().any(|p| p == name) {
                builtin.push(name.to_string());
            }
        })
    }

    pub fn remove_builtin_plugin(&self, name: &str) -> Result<()> {
        self.edit_config(|config| config.builtin_plugins_mut().retain(|p| p != name))
    }

    /// Convert a legacy manifest to the grouped layout. Returns `false` when
    /// it already is grouped.
    pub fn upgrade_format(&self) -> Result<bool> {
        self.migrate(|config| match config {
            NoneBotConfig::Legacy(legacy) => Some(NoneBotConfig::Grouped(legacy.upgrade())),
            NoneBotConfig::Grouped(_) => None,
        })
    }

    /// Convert a grouped manifest to the legacy layout. Returns `false` when
    /// it already is legacy.
    pub fn downgrade_format(&self) -> Result<bool> {
        self.migrate(|config| match config {
            NoneBotConfig::Grouped(grouped) => Some(NoneBotConfig::Legacy(grouped.downgrade())),
            NoneBotConfig::Legacy(_) => None,
        })
    }

    /// Requirements listed in `project.dependencies`, or in the named
    /// dependency group. Entries that do not parse are skipped.
    pub fn get_dependencies(&self, group: Option<&str>) -> Result<Vec<Requirement>> {
        let _guard = lock();
        let doc = self.load()?;
        let project = doc.get("project").and_then(Item::as_table_like);
        let item = match group {
            None => project.and_then(|p| p.get("dependencies")),
            Some(group) => project
                .and_then(|p| p.get(DEPENDENCY_GROUPS))
                .and_then(Item::as_table_like)
                .and_then(|groups| groups.get(group)),
        };
        let raw = decode_list(item, "project.dependencies", decode_string)?;
        Ok(raw.iter().filter_map(|entry| parse_entry(entry)).collect())
    }

    /// Record newly installed requirements. An existing entry for the same
    /// project keeps its version constraint and gains the new extras.
    pub fn add_dependency(&self, reqs: &[Requirement], group: Option<&str>) -> Result<()> {
        self.edit_project(|project| {
            let mut list = read_list(project, group)?;
            for req in reqs {
                upsert(&mut list, req, false);
            }
            write_list(project, group, &list)
        })
    }

    /// Record upgraded requirements. Every list that already names the
    /// project takes the new constraint; otherwise it is added to
    /// `project.dependencies`.
    pub fn update_dependency(&self, reqs: &[Requirement]) -> Result<()> {
        self.edit_project(|project| {
            let groups = group_names(project);
            for req in reqs {
                let mut touched = false;
                for group in all_lists(&groups) {
                    let mut list = read_list(project, group)?;
                    if list.iter().any(|e| names_project(e, req)) {
                        upsert(&mut list, req, true);
                        write_list(project, group, &list)?;
                        touched = true;
                    }
                }
                if !touched {
                    let mut list = read_list(project, None)?;
                    upsert(&mut list, req, true);
                    write_list(project, None, &list)?;
                }
            }
            Ok(())
        })
    }

    /// Drop requirements from `project.dependencies` and every dependency
    /// group. Returns the requirements that are no longer referenced at all
    /// and can be uninstalled; a removal that only trims extras is not
    /// returned.
    pub fn remove_dependency(&self, reqs: &[Requirement]) -> Result<Vec<Requirement>> {
        self.edit_project(|project| {
            let groups = group_names(project);
            let mut freed = Vec::new();
            for req in reqs {
                let mut trimmed = false;
                for group in all_lists(&groups) {
                    let mut list = read_list(project, group)?;
                    match subtract(&mut list, req) {
                        Removal::Absent => continue,
                        Removal::Full => {}
                        Removal::Trimmed => trimmed = true,
                    }
                    write_list(project, group, &list)?;
                }
                if !trimmed && req.extras.is_empty() {
                    freed.push(req.clone());
                }
            }
            Ok(freed)
        })
    }

    fn cached_policy(&self) -> MutexGuard<'_, Option<Policy>> {
        self.policy.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn probe(&self, doc: &DocumentMut) -> Result<Policy> {
        let policy = Policy::probe(doc)?;
        if policy == Policy::Legacy {
            LEGACY_WARNING.call_once(|| {
                warn!(
                    "{} uses the legacy manifest format; run `nb upgrade-format` to migrate",
                    self.path.display()
                );
            });
        }
        *self.cached_policy() = Some(policy);
        Ok(policy)
    }

    fn load(&self) -> Result<DocumentMut> {
        if !self.path.is_file() {
            let root = self.path.parent().unwrap_or(&self.path).to_path_buf();
            return Err(CliError::ProjectNotFound {
                searched_from: root,
            });
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(text.parse::<DocumentMut>()?)
    }

    /// Write through a sibling temp file and rename it over the manifest.
    fn save(&self, doc: &DocumentMut) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, doc.to_string())?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "manifest written");
        Ok(())
    }

    fn edit_config<R>(&self, edit: impl FnOnce(&mut NoneBotConfig) -> R) -> Result<R> {
        let _guard = lock();
        let mut doc = self.load()?;
        let original = self.probe(&doc)?.decode(&doc)?;
        let mut config = original.clone();
        let result = edit(&mut config);
        if config != original {
            policy::apply(&mut doc, &config)?;
            self.save(&doc)?;
        }
        Ok(result)
    }

    fn migrate(
        &self,
        convert: impl FnOnce(&NoneBotConfig) -> Option<NoneBotConfig>,
    ) -> Result<bool> {
        let _guard = lock();
        let mut doc = self.load()?;
        let config = Policy::probe(&doc)?.decode(&doc)?;
        let Some(converted) = convert(&config) else {
            return Ok(false);
        };
        policy::apply(&mut doc, &converted)?;
        self.save(&doc)?;
        *self.cached_policy() = None;
        Ok(true)
    }

    fn edit_project<R>(&self, edit: impl FnOnce(&mut dyn TableLike) -> Result<R>) -> Result<R> {
        let _guard = lock();
        let mut doc = self.load()?;
        let before = doc.to_string();
        let had_project = doc.contains_key("project");
        let project = doc
            .entry("project")
            .or_insert(Item::Table(Table::new()))
            .as_table_like_mut()
            .ok_or_else(|| CliError::ProjectInvalid("`project` is not a table".to_string()))?;
        let result = edit(project)?;
        if !had_project
            && doc
                .get("project")
                .and_then(Item::as_table_like)
                .is_some_and(|t| t.is_empty())
        {
            doc.remove("project");
        }
        if doc.to_string() != before {
            self.save(&doc)?;
        }
        Ok(result)
    }
}

fn lock() -> MutexGuard<'static, ()> {
    MANIFEST_LOCK.lock().unwrap_or_else(|p| p.into_inner())
}

fn parse_entry(entry: &str) -> Option<Requirement> {
    match entry.parse() {
        Ok(req) => Some(req),
        Err(err) => {
            debug!(%entry, %err, "skipping unparseable dependency");
            None
        }
    }
}

fn names_project(entry: &str, req: &Requirement) -> bool {
    parse_entry(entry).is_some_and(|existing| existing.same_project(req))
}

fn group_names(project: &dyn TableLike) -> Vec<String> {
    project
        .get(DEPENDENCY_GROUPS)
        .and_then(Item::as_table_like)
        .map(|groups| groups.iter().map(|(name, _)| name.to_string()).collect())
        .unwrap_or_default()
}

/// `None` for `project.dependencies`, then every named group.
fn all_lists(groups: &[String]) -> impl Iterator<Item = Option<&str>> {
    std::iter::once(None).chain(groups.iter().map(|g| Some(g.as_str())))
}

fn read_list(project: &dyn TableLike, group: Option<&str>) -> Result<Vec<String>> {
    let item = match group {
        None => project.get("dependencies"),
        Some(group) => project
            .get(DEPENDENCY_GROUPS)
            .and_then(Item::as_table_like)
            .and_then(|groups| groups.get(group)),
    };
    decode_list(item, "project.dependencies", decode_string)
}

fn write_list(project: &mut dyn TableLike, group: Option<&str>, list: &[String]) -> Result<()> {
    match group {
        None => patch_list(project, "dependencies", list, false, decode_string, encode_string),
        Some(group) => {
            let groups = project
                .entry(DEPENDENCY_GROUPS)
                .or_insert(Item::Table(Table::new()))
                .as_table_like_mut()
                .ok_or_else(|| {
                    let msg = format!("`project.{DEPENDENCY_GROUPS}` is not a table");
                    CliError::ProjectInvalid(msg)
                })?;
            patch_list(groups, group, list, false, decode_string, encode_string);
        }
    }
    Ok(())
}

/// Fold every entry naming `req`'s project into the first one, then merge
/// `req` into it. `versioned` selects whether `req`'s constraint replaces
/// the existing one.
fn upsert(list: &mut Vec<String>, req: &Requirement, versioned: bool) {
    let matches: Vec<(usize, Requirement)> = list
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| parse_entry(entry).map(|r| (i, r)))
        .filter(|(_, existing)| existing.same_project(req))
        .collect();

    let Some(((first, base), rest)) = matches.split_first() else {
        list.push(req.to_string());
        return;
    };

    let folded = rest.iter().fold(base.clone(), |acc, (_, r)| acc.merge(r));
    let incoming = if versioned { req.clone() } else { req.unversioned() };
    let merged = folded.merge(&incoming);

    if rest.is_empty() && merged == *base {
        return;
    }
    list[*first] = merged.to_string();
    for (index, _) in rest.iter().rev() {
        list.remove(*index);
    }
}

enum Removal {
    Absent,
    Full,
    Trimmed,
}

fn subtract(list: &mut Vec<String>, req: &Requirement) -> Removal {
    let matches: Vec<(usize, Requirement)> = list
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| parse_entry(entry).map(|r| (i, r)))
        .filter(|(_, existing)| existing.same_project(req))
        .collect();
    let Some(((first, base), rest)) = matches.split_first() else {
        return Removal::Absent;
    };

    let folded = rest.iter().fold(base.clone(), |acc, (_, r)| acc.merge(r));
    match folded.subtract(req) {
        None => {
            for (index, _) in matches.iter().rev() {
                list.remove(*index);
            }
            Removal::Full
        }
        Some(trimmed) => {
            for (index, _) in rest.iter().rev() {
                list.remove(*index);
            }
            list[*first] = trimmed.to_string();
            Removal::Trimmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(text: &str) -> (tempfile::TempDir, ManifestStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), text).unwrap();
        let store = ManifestStore::new(dir.path());
        (dir, store)
    }

    fn onebot() -> Package {
        Package {
            name: "OneBot V11".to_string(),
            module_name: "nonebot.adapters.onebot.v11".to_string(),
            project_link: "nonebot-adapter-onebot".to_string(),
            version: "2.4.3".to_string(),
            ..Package::default()
        }
    }

    fn req(s: &str) -> Requirement {
        s.parse().unwrap()
    }

    const GROUPED: &str = r#"[project]
name = "bot"
dependencies = ["nonebot2[fastapi]>=2.3.0"]

[tool.nonebot]
plugin_dirs = []
builtin_plugins = []

[tool.nonebot.adapters]

[tool.nonebot.plugins]
"#;

    #[test]
    fn add_adapter_creates_bucket_once() {
        let (_dir, store) = project(GROUPED);
        store.add_adapter(&onebot()).unwrap();
        let after_first = fs::read_to_string(store.path()).unwrap();
        store.add_adapter(&onebot()).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), after_first);

        let NoneBotConfig::Grouped(config) = store.read().unwrap() else {
            panic!("expected grouped config");
        };
        assert_eq!(
            config.adapters,
            vec![(
                "nonebot-adapter-onebot".to_string(),
                vec![SimpleInfo {
                    name: "OneBot V11".to_string(),
                    module_name: "nonebot.adapters.onebot.v11".to_string(),
                }]
            )]
        );
    }

    #[test]
    fn add_then_remove_adapter_restores_file() {
        let (_dir, store) = project(GROUPED);
        store.add_adapter(&onebot()).unwrap();
        assert!(store.remove_adapter(&onebot()).unwrap());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), GROUPED);
    }

    #[test]
    fn inline_adapters_table_empties_back_to_braces() {
        let (_dir, store) =
            project("[tool.nonebot]\nadapters = {}\nplugins = {}\n");
        store.add_adapter(&onebot()).unwrap();
        assert!(store.remove_adapter(&onebot()).unwrap());

        let NoneBotConfig::Grouped(config) = store.read().unwrap() else {
            panic!("expected grouped config");
        };
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn removing_unknown_plugin_is_a_noop() {
        let (_dir, store) = project(GROUPED);
        assert!(store.remove_plugin("nonebot_plugin_missing").unwrap());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), GROUPED);
    }

    #[test]
    fn plugin_paths_go_to_local_bucket() {
        let (_dir, store) = project(GROUPED);
        store.add_plugin("src.plugins.echo").unwrap();
        let NoneBotConfig::Grouped(config) = store.read().unwrap() else {
            panic!("expected grouped config");
        };
        assert_eq!(
            config.plugins,
            vec![(LOCAL_BUCKET.to_string(), vec!["src.plugins.echo".to_string()])]
        );
    }

    #[test]
    fn builtin_plugins_round_trip() {
        let (_dir, store) = project(GROUPED);
        store.add_builtin_plugin("echo").unwrap();
        store.add_builtin_plugin("echo").unwrap();
        assert_eq!(store.read().unwrap().builtin_plugins(), ["echo".to_string()]);
        store.remove_builtin_plugin("echo").unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), GROUPED);
    }

    #[test]
    fn legacy_manifest_upgrades_to_local_buckets() {
        let (_dir, store) = project(
            "[tool.nonebot]\nadapters = [{name=\"X\", module_name=\"m.x\"}]\nplugins = [\"m.y\"]\n",
        );
        assert_eq!(store.policy().unwrap(), Policy::Legacy);
        assert!(store.upgrade_format().unwrap());
        assert!(!store.upgrade_format().unwrap());
        assert_eq!(store.policy().unwrap(), Policy::Grouped);

        let NoneBotConfig::Grouped(config) = store.read().unwrap() else {
            panic!("expected grouped config");
        };
        assert_eq!(
            config.adapters,
            vec![(
                LOCAL_BUCKET.to_string(),
                vec![SimpleInfo {
                    name: "X".to_string(),
                    module_name: "m.x".to_string()
                }]
            )]
        );
        assert_eq!(
            config.plugins,
            vec![(LOCAL_BUCKET.to_string(), vec!["m.y".to_string()])]
        );

        assert!(store.downgrade_format().unwrap());
        let NoneBotConfig::Legacy(legacy) = store.read().unwrap() else {
            panic!("expected legacy config");
        };
        assert_eq!(legacy.plugins, vec!["m.y".to_string()]);
        assert_eq!(legacy.adapters.len(), 1);
    }

    #[test]
    fn missing_manifest_is_project_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(matches!(store.read(), Err(CliError::ProjectNotFound { .. })));
    }

    #[test]
    fn add_dependency_appends_new_projects_with_version() {
        let (_dir, store) = project(GROUPED);
        store
            .add_dependency(&[req("nonebot-adapter-onebot>=2.4.3")], None)
            .unwrap();
        let deps = store.get_dependencies(None).unwrap();
        assert_eq!(
            deps.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["nonebot2[fastapi]>=2.3.0", "nonebot-adapter-onebot>=2.4.3"]
        );
    }

    #[test]
    fn add_dependency_keeps_existing_constraint() {
        let (_dir, store) = project(GROUPED);
        store
            .add_dependency(&[req("NoneBot2[websockets]>=9")], None)
            .unwrap();
        let deps = store.get_dependencies(None).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].to_string(), "nonebot2[fastapi,websockets]>=2.3.0");
    }

    #[test]
    fn update_dependency_replaces_constraint() {
        let (_dir, store) = project(GROUPED);
        store.update_dependency(&[req("nonebot2>=2.4")]).unwrap();
        let deps = store.get_dependencies(None).unwrap();
        assert_eq!(deps[0].to_string(), "nonebot2[fastapi]>=2.4");
    }

    #[test]
    fn duplicate_entries_are_folded() {
        let (_dir, store) = project(
            "[project]\ndependencies = [\"pkg[a]>=1\", \"other\", \"Pkg[b]\"]\n",
        );
        store.add_dependency(&[req("pkg")], None).unwrap();
        let deps = store.get_dependencies(None).unwrap();
        assert_eq!(
            deps.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["pkg[a,b]>=1", "other"]
        );
    }

    #[test]
    fn dev_group_dependencies() {
        let (_dir, store) = project(GROUPED);
        store.add_dependency(&[req("pytest>=8")], Some("dev")).unwrap();
        let dev = store.get_dependencies(Some("dev")).unwrap();
        assert_eq!(dev, vec![req("pytest>=8")]);
        assert_eq!(store.get_dependencies(None).unwrap().len(), 1);

        let freed = store.remove_dependency(&[req("pytest")]).unwrap();
        assert_eq!(freed, vec![req("pytest")]);
        assert!(store.get_dependencies(Some("dev")).unwrap().is_empty());
    }

    #[test]
    fn subtracting_extras_keeps_requirement() {
        let (_dir, store) = project("[project]\ndependencies = [\"pkg[a,b,c]>=1\"]\n");
        let freed = store.remove_dependency(&[req("pkg[b]")]).unwrap();
        assert!(freed.is_empty());
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "[project]\ndependencies = [\"pkg[a,c]>=1\"]\n"
        );
    }

    #[test]
    fn full_removal_frees_requirement() {
        let (_dir, store) = project(GROUPED);
        let freed = store.remove_dependency(&[req("nonebot2")]).unwrap();
        assert_eq!(freed, vec![req("nonebot2")]);
        assert!(store.get_dependencies(None).unwrap().is_empty());
    }

    #[test]
    fn concurrent_dependency_edits_are_all_kept() {
        let (dir, _store) = project(GROUPED);
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let root = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    ManifestStore::new(&root)
                        .add_dependency(&[req(&format!("nonebot-plugin-n{i}>=1.0"))], None)
                        .unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let deps = ManifestStore::new(dir.path()).get_dependencies(None).unwrap();
        assert_eq!(deps.len(), 9);
        assert!(deps.contains(&req("nonebot2[fastapi]>=2.3.0")));
        for i in 0..8 {
            assert!(deps.contains(&req(&format!("nonebot-plugin-n{i}>=1.0"))));
        }
    }
}
