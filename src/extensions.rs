// SPDX-License-Identifier: GPL-3.0-or-later

//! Installing, updating and removing adapters, drivers and plugins.
//!
//! Each flow keeps the environment and the manifest consistent: an install
//! only records the manifest entry once the package manager succeeded, and an
//! uninstall drops the manifest entry first and only asks the package manager
//! to remove the distribution when nothing else in the manifest still uses it.

use tracing::{debug, info};

use crate::environment::EnvironmentExecutor;
use crate::error::{CliError, Result};
use crate::manifest::{ManifestStore, NoneBotConfig, Requirement};
use crate::registry::{ModuleKind, Package, RegistryClient, find_exact_package};

#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Request `dist>=version` with the registry version instead of the
    /// bare distribution.
    pub restrict_version: bool,
    pub dev: bool,
    pub extra_args: Vec<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            restrict_version: true,
            dev: false,
            extra_args: Vec::new(),
        }
    }
}

pub struct Extensions<'a> {
    registry: &'a RegistryClient,
    manifest: &'a ManifestStore,
    executor: &'a dyn EnvironmentExecutor,
}

impl<'a> Extensions<'a> {
    pub fn new(
        registry: &'a RegistryClient,
        manifest: &'a ManifestStore,
        executor: &'a dyn EnvironmentExecutor,
    ) -> Self {
        Self {
            registry,
            manifest,
            executor,
        }
    }

    /// The package `query` names in the catalog of `kind`.
    ///
    /// With `allow_unpublished`, a query that is not in the catalog but is a
    /// plain distribution name resolves to an unpublished descriptor for it.
    pub async fn resolve(
        &self,
        kind: ModuleKind,
        query: &str,
        allow_unpublished: bool,
    ) -> Result<Package> {
        let candidates = self.registry.list(kind, None, true).await?;
        match find_exact_package(query, &candidates) {
            Ok(pkg) => Ok(pkg.clone()),
            Err(CliError::NoSelectablePackage(_)) if allow_unpublished => {
                unpublished_package(query).ok_or_else(|| {
                    CliError::NoSelectablePackage(query.to_string())
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn install(
        &self,
        kind: ModuleKind,
        pkg: &Package,
        options: &InstallOptions,
    ) -> Result<()> {
        let req = pkg.requirement(options.restrict_version)?;
        self.executor
            .install(std::slice::from_ref(&req), &options.extra_args, options.dev)
            .await?;

        match kind {
            ModuleKind::Adapter => self.manifest.add_adapter(pkg)?,
            ModuleKind::Plugin => self.manifest.add_plugin(pkg)?,
            ModuleKind::Driver => {}
        }
        if !self.registry.load(kind).await?.contains(pkg) {
            self.registry.remember_unpublished(kind, pkg).await?;
        }
        info!(%kind, %req, "installed");
        Ok(())
    }

    pub async fn update(&self, pkg: &Package, extra_args: &[String]) -> Result<()> {
        let req = pkg.requirement(false)?;
        self.executor.update(&[req], extra_args).await
    }

    /// Remove `pkg` from the manifest and, when no other entry still needs
    /// its distribution, from the environment. Returns whether the package
    /// manager was asked to uninstall.
    pub async fn uninstall(
        &self,
        kind: ModuleKind,
        pkg: &Package,
        extra_args: &[String],
    ) -> Result<bool> {
        let can_uninstall = match kind {
            ModuleKind::Adapter => self.manifest.remove_adapter(pkg)?,
            ModuleKind::Plugin => self.manifest.remove_plugin(pkg)?,
            ModuleKind::Driver => true,
        };
        if !can_uninstall {
            debug!(dist = %pkg.project_link, "distribution still referenced, keeping it installed");
            return Ok(false);
        }
        let req: Requirement = pkg.requirement(false)?;
        self.executor.uninstall(&[req], extra_args).await?;
        Ok(true)
    }

    /// Catalog packages (published or remembered) the project uses.
    ///
    /// Adapters and plugins come from `tool.nonebot`; drivers from the
    /// project's main dependency list.
    pub async fn list_installed(&self, kind: ModuleKind) -> Result<Vec<Package>> {
        let candidates = self.registry.list(kind, None, true).await?;
        let installed: Vec<Package> = match kind {
            ModuleKind::Driver => {
                let deps = self.manifest.get_dependencies(None)?;
                candidates
                    .into_iter()
                    .filter(|pkg| {
                        pkg.requirement(false)
                            .is_ok_and(|req| deps.iter().any(|dep| dep.same_project(&req)))
                    })
                    .collect()
            }
            ModuleKind::Adapter | ModuleKind::Plugin => {
                let config = self.manifest.read()?;
                candidates
                    .into_iter()
                    .filter(|pkg| in_manifest(&config, kind, pkg))
                    .collect()
            }
        };
        Ok(installed)
    }
}

fn in_manifest(config: &NoneBotConfig, kind: ModuleKind, pkg: &Package) -> bool {
    match (config, kind) {
        (NoneBotConfig::Grouped(grouped), ModuleKind::Adapter) => {
            grouped.adapters.iter().any(|(dist, adapters)| {
                *dist == pkg.project_link
                    && adapters.iter().any(|a| a.module_name == pkg.module_name)
            })
        }
        (NoneBotConfig::Grouped(grouped), ModuleKind::Plugin) => {
            grouped.plugins.iter().any(|(dist, plugins)| {
                *dist == pkg.project_link && plugins.iter().any(|m| *m == pkg.module_name)
            })
        }
        (NoneBotConfig::Legacy(legacy), ModuleKind::Adapter) => legacy
            .adapters
            .iter()
            .any(|a| a.module_name == pkg.module_name),
        (NoneBotConfig::Legacy(legacy), ModuleKind::Plugin) => {
            legacy.plugins.iter().any(|m| *m == pkg.module_name)
        }
        (_, ModuleKind::Driver) => false,
    }
}

/// Descriptor for a distribution the registry does not list. The import path
/// is guessed from the distribution name.
pub fn unpublished_package(dist: &str) -> Option<Package> {
    let req: Requirement = dist.parse().ok()?;
    if !req.extras.is_empty() || !req.specifier.is_empty() || req.url.is_some() {
        return None;
    }
    Some(Package {
        module_name: req.name.replace(['-', '.'], "_"),
        project_link: req.name.clone(),
        name: req.name,
        ..Package::default()
    })
}
