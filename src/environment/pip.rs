// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{EnvironmentExecutor, ManagerKind, command_line, run_checked};
use crate::error::Result;
use crate::manifest::{ManifestStore, Requirement};
use crate::process::SpawnOptions;

const DEV_GROUP: &str = "dev";

/// Drives `python -m pip`.
///
/// pip does not track project dependencies, so after each successful
/// operation the same edit is applied to the manifest's dependency lists.
/// Without a manifest (self management) only pip runs.
pub struct PipExecutor {
    python: PathBuf,
    options: SpawnOptions,
    manifest: Option<ManifestStore>,
}

impl PipExecutor {
    pub fn new(python: PathBuf, options: SpawnOptions, manifest: Option<ManifestStore>) -> Self {
        Self {
            python,
            options,
            manifest,
        }
    }

    fn argv(&self, verb: &[&str], reqs: &[Requirement], extra_args: &[String]) -> Vec<String> {
        let verb: Vec<&str> = ["-m", "pip"].into_iter().chain(verb.iter().copied()).collect();
        command_line(&self.python, &verb, reqs, extra_args)
    }
}

#[async_trait]
impl EnvironmentExecutor for PipExecutor {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Pip
    }

    async fn init(&self, _extra_args: &[String]) -> Result<()> {
        Ok(())
    }

    async fn lock(&self, _extra_args: &[String]) -> Result<()> {
        Ok(())
    }

    async fn sync(&self, extra_args: &[String]) -> Result<()> {
        let argv = self.argv(&["install", "-e", "."], &[], extra_args);
        run_checked(&argv, &self.options).await
    }

    async fn install(
        &self,
        reqs: &[Requirement],
        extra_args: &[String],
        dev: bool,
    ) -> Result<()> {
        run_checked(&self.argv(&["install"], reqs, extra_args), &self.options).await?;
        if let Some(manifest) = &self.manifest {
            manifest.add_dependency(reqs, dev.then_some(DEV_GROUP))?;
        }
        Ok(())
    }

    async fn update(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()> {
        let argv = self.argv(&["install", "--upgrade"], reqs, extra_args);
        run_checked(&argv, &self.options).await?;
        if let Some(manifest) = &self.manifest {
            manifest.update_dependency(reqs)?;
        }
        Ok(())
    }

    async fn uninstall(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()> {
        let freed = match &self.manifest {
            Some(manifest) => manifest.remove_dependency(reqs)?,
            None => reqs.to_vec(),
        };
        if freed.is_empty() {
            debug!("no requirement is fully unreferenced, nothing to uninstall");
            return Ok(());
        }
        let argv = self.argv(&["uninstall"], &freed, extra_args);
        run_checked(&argv, &self.options).await
    }
}
