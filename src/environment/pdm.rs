// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use async_trait::async_trait;

use super::{EnvironmentExecutor, ManagerKind, command_line, run_checked, tool_path, with_dev};
use crate::error::Result;
use crate::manifest::Requirement;
use crate::process::SpawnOptions;

pub struct PdmExecutor {
    program: PathBuf,
    options: SpawnOptions,
}

impl PdmExecutor {
    pub fn new(options: SpawnOptions) -> Self {
        Self::with_program(tool_path("pdm"), options)
    }

    pub fn with_program(program: PathBuf, options: SpawnOptions) -> Self {
        Self { program, options }
    }

    fn argv(&self, verb: &str, reqs: &[Requirement], extra_args: &[String]) -> Vec<String> {
        command_line(&self.program, &[verb], reqs, extra_args)
    }
}

#[async_trait]
impl EnvironmentExecutor for PdmExecutor {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Pdm
    }

    async fn init(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("init", &[], extra_args), &self.options).await
    }

    async fn lock(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("lock", &[], extra_args), &self.options).await
    }

    async fn sync(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("sync", &[], extra_args), &self.options).await
    }

    async fn install(
        &self,
        reqs: &[Requirement],
        extra_args: &[String],
        dev: bool,
    ) -> Result<()> {
        let argv = self.argv("add", reqs, &with_dev(extra_args, dev));
        run_checked(&argv, &self.options).await
    }

    async fn update(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("update", reqs, extra_args), &self.options).await
    }

    async fn uninstall(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("remove", reqs, extra_args), &self.options).await
    }
}
