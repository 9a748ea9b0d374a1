// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use async_trait::async_trait;

use super::{EnvironmentExecutor, ManagerKind, command_line, run_checked, tool_path, with_dev};
use crate::error::Result;
use crate::manifest::Requirement;
use crate::process::SpawnOptions;

/// Drives `poetry`. Syncing is `poetry install`.
pub struct PoetryExecutor {
    program: PathBuf,
    options: SpawnOptions,
}

impl PoetryExecutor {
    pub fn new(options: SpawnOptions) -> Self {
        Self::with_program(tool_path("poetry"), options)
    }

    pub fn with_program(program: PathBuf, options: SpawnOptions) -> Self {
        Self { program, options }
    }

    fn argv(&self, verb: &str, reqs: &[Requirement], extra_args: &[String]) -> Vec<String> {
        command_line(&self.program, &[verb], reqs, extra_args)
    }
}

#[async_trait]
impl EnvironmentExecutor for PoetryExecutor {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Poetry
    }

    async fn init(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("init", &[], extra_args), &self.options).await
    }

    async fn lock(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("lock", &[], extra_args), &self.options).await
    }

    async fn sync(&self, extra_args: &[String]) -> Result<()> {
        run_checked(&self.argv("install", &[], extra_args), &self.options).await
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

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::signals::tests_support::serial;

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_runs_install() {
        let _guard = serial();
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake-poetry");
        fs::write(&script, "#!/bin/sh\necho \"$*\" > \"$(dirname \"$0\")/args\"\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let poetry = PoetryExecutor::with_program(script, SpawnOptions::in_dir(tmp.path()));
        poetry.sync(&["--no-root".to_string()]).await.unwrap();

        let args = fs::read_to_string(tmp.path().join("args")).unwrap();
        assert_eq!(args.trim_end(), "install --no-root");
    }
}
