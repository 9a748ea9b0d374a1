// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed views of the `tool.nonebot` table, one per on-disk format.

use crate::registry::Package;

/// Bucket key for modules that live inside the project.
pub const LOCAL_BUCKET: &str = "@local";

/// Adapter entry as stored in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleInfo {
    pub name: String,
    pub module_name: String,
}

impl From<&Package> for SimpleInfo {
    fn from(pkg: &Package) -> Self {
        Self {
            name: pkg.name.clone(),
            module_name: pkg.module_name.clone(),
        }
    }
}

/// What a plugin operation refers to: a registry package or a bare module
/// path inside the project.
#[derive(Debug, Clone, Copy)]
pub enum PluginRef<'a> {
    Package(&'a Package),
    Module(&'a str),
}

impl PluginRef<'_> {
    fn bucket(&self) -> &str {
        match self {
            PluginRef::Package(pkg) => bucket_of(pkg),
            PluginRef::Module(_) => LOCAL_BUCKET,
        }
    }

    fn module_name(&self) -> &str {
        match self {
            PluginRef::Package(pkg) => &pkg.module_name,
            PluginRef::Module(module) => module,
        }
    }
}

impl<'a> From<&'a Package> for PluginRef<'a> {
    fn from(pkg: &'a Package) -> Self {
        PluginRef::Package(pkg)
    }
}

impl<'a> From<&'a str> for PluginRef<'a> {
    fn from(module: &'a str) -> Self {
        PluginRef::Module(module)
    }
}

fn bucket_of(pkg: &Package) -> &str {
    if pkg.is_local() {
        LOCAL_BUCKET
    } else {
        &pkg.project_link
    }
}

/// An ordered mapping from bucket key to entries. Order follows the file.
pub type Buckets<T> = Vec<(String, Vec<T>)>;

fn bucket_mut<'a, T>(buckets: &'a mut Buckets<T>, key: &str) -> &'a mut Vec<T> {
    let pos = match buckets.iter().position(|(k, _)| k == key) {
        Some(pos) => pos,
        None => {
            buckets.push((key.to_string(), Vec::new()));
            buckets.len() - 1
        }
    };
    &mut buckets[pos].1
}

/// Remove the first entry matching `is_target` from bucket `key`.
///
/// Returns whether the distribution behind the bucket is no longer referenced.
fn remove_from_bucket<T>(
    buckets: &mut Buckets<T>,
    key: &str,
    is_target: impl Fn(&T) -> bool,
) -> bool {
    let Some(pos) = buckets.iter().position(|(k, _)| k == key) else {
        return true;
    };
    let entries = &mut buckets[pos].1;
    if let Some(index) = entries.iter().position(is_target) {
        entries.remove(index);
    }
    if entries.is_empty() && key != LOCAL_BUCKET {
        buckets.remove(pos);
        return true;
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedConfig {
    pub adapters: Buckets<SimpleInfo>,
    pub plugins: Buckets<String>,
    pub plugin_dirs: Vec<String>,
    pub builtin_plugins: Vec<String>,
}

impl GroupedConfig {
    pub fn add_adapter(&mut self, pkg: &Package) {
        let bucket = bucket_mut(&mut self.adapters, bucket_of(pkg));
        if !bucket.iter().any(|a| a.module_name == pkg.module_name) {
            bucket.push(SimpleInfo::from(pkg));
        }
    }

    pub fn remove_adapter(&mut self, pkg: &Package) -> bool {
        remove_from_bucket(&mut self.adapters, bucket_of(pkg), |a| {
            a.module_name == pkg.module_name
        })
    }

    pub fn add_plugin(&mut self, plugin: PluginRef<'_>) {
        let bucket = bucket_mut(&mut self.plugins, plugin.bucket());
        if !bucket.iter().any(|p| p == plugin.module_name()) {
            bucket.push(plugin.module_name().to_string());
        }
    }

    pub fn remove_plugin(&mut self, plugin: PluginRef<'_>) -> bool {
        remove_from_bucket(&mut self.plugins, plugin.bucket(), |p| {
            p == plugin.module_name()
        })
    }

    /// Flatten into the legacy shape: adapters deduplicated by import path,
    /// plugins by value, bucket order preserved.
    pub fn downgrade(&self) -> LegacyConfig {
        let mut adapters: Vec<SimpleInfo> = Vec::new();
        for adapter in self.adapters.iter().flat_map(|(_, list)| list) {
            if !adapters.iter().any(|a| a.module_name == adapter.module_name) {
                adapters.push(adapter.clone());
            }
        }
        let mut plugins: Vec<String> = Vec::new();
        for plugin in self.plugins.iter().flat_map(|(_, list)| list) {
            if !plugins.contains(plugin) {
                plugins.push(plugin.clone());
            }
        }
        LegacyConfig {
            adapters,
            plugins,
            plugin_dirs: self.plugin_dirs.clone(),
            builtin_plugins: self.builtin_plugins.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyConfig {
    pub adapters: Vec<SimpleInfo>,
    pub plugins: Vec<String>,
    pub plugin_dirs: Vec<String>,
    pub builtin_plugins: Vec<String>,
}

impl LegacyConfig {
    pub fn add_adapter(&mut self, pkg: &Package) {
        if !self.adapters.iter().any(|a| a.module_name == pkg.module_name) {
            self.adapters.push(SimpleInfo::from(pkg));
        }
    }

    pub fn remove_adapter(&mut self, pkg: &Package) -> bool {
        self.adapters.retain(|a| a.module_name != pkg.module_name);
        true
    }

    pub fn add_plugin(&mut self, plugin: PluginRef<'_>) {
        let module = plugin.module_name();
        if !self.plugins.iter().any(|p| p == module) {
            self.plugins.push(module.to_string());
        }
    }

    pub fn remove_plugin(&mut self, plugin: PluginRef<'_>) -> bool {
        let module = plugin.module_name();
        self.plugins.retain(|p| p != module);
        true
    }

    /// Move every entry under the `@local` bucket.
    pub fn upgrade(&self) -> GroupedConfig {
        let mut grouped = GroupedConfig {
            plugin_dirs: self.plugin_dirs.clone(),
            builtin_plugins: self.builtin_plugins.clone(),
            ..GroupedConfig::default()
        };
        if !self.adapters.is_empty() {
            grouped
                .adapters
                .push((LOCAL_BUCKET.to_string(), self.adapters.clone()));
        }
        if !self.plugins.is_empty() {
            grouped
                .plugins
                .push((LOCAL_BUCKET.to_string(), self.plugins.clone()));
        }
        grouped
    }
}

/// The `tool.nonebot` table in whichever format the project uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoneBotConfig {
    Grouped(GroupedConfig),
    Legacy(LegacyConfig),
}

impl NoneBotConfig {
    pub fn add_adapter(&mut self, pkg: &Package) {
        match self {
            NoneBotConfig::Grouped(c) => c.add_adapter(pkg),
            NoneBotConfig::Legacy(c) => c.add_adapter(pkg),
        }
    }

    pub fn remove_adapter(&mut self, pkg: &Package) -> bool {
        match self {
            NoneBotConfig::Grouped(c) => c.remove_adapter(pkg),
            NoneBotConfig::Legacy(c) => c.remove_adapter(pkg),
        }
    }

    pub fn add_plugin(&mut self, plugin: PluginRef<'_>) {
        match self {
            NoneBotConfig::Grouped(c) => c.add_plugin(plugin),
            NoneBotConfig::Legacy(c) => c.add_plugin(plugin),
        }
    }

    pub fn remove_plugin(&mut self, plugin: PluginRef<'_>) -> bool {
        match self {
            NoneBotConfig::Grouped(c) => c.remove_plugin(plugin),
            NoneBotConfig::Legacy(c) => c.remove_plugin(plugin),
        }
    }

    pub fn builtin_plugins(&self) -> &[String] {
        match self {
            NoneBotConfig::Grouped(c) => &c.builtin_plugins,
            NoneBotConfig::Legacy(c) => &c.builtin_plugins,
        }
    }

    pub fn builtin_plugins_mut(&mut self) -> &mut Vec<String> {
        match self {
            NoneBotConfig::Grouped(c) => &mut c.builtin_plugins,
            NoneBotConfig::Legacy(c) => &mut c.builtin_plugins,
        }
    }

    pub fn plugin_dirs(&self) -> &[String] {
        match self {
            NoneBotConfig::Grouped(c) => &c.plugin_dirs,
            NoneBotConfig::Legacy(c) => &c.plugin_dirs,
        }
    }

    /// Every adapter in file order, ignoring buckets.
    pub fn adapters(&self) -> Vec<&SimpleInfo> {
        match self {
            NoneBotConfig::Grouped(c) => c.adapters.iter().flat_map(|(_, l)| l).collect(),
            NoneBotConfig::Legacy(c) => c.adapters.iter().collect(),
        }
    }

    /// Every plugin module path in file order, ignoring buckets.
    pub fn plugins(&self) -> Vec<&str> {
        match self {
            NoneBotConfig::Grouped(c) => c
                .plugins
                .iter()
                .flat_map(|(_, l)| l)
                .map(String::as_str)
                .collect(),
            NoneBotConfig::Legacy(c) => c.plugins.iter().map(String::as_str).collect(),
        }
    }
}
