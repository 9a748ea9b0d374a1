// SPDX-License-Identifier: GPL-3.0-or-later

//! Package-manager backends.
//!
//! A project is governed by one of four environment managers. Each one is a
//! backend implementing [`EnvironmentExecutor`]: the same six operations
//! (`init`, `lock`, `sync`, `install`, `update`, `uninstall`) translated into
//! that tool's command line and run as a child process through
//! [`crate::process`].
//!
//! [`probe()`] infers which manager a project uses from its lock file and
//! which one can actually be run from `PATH`; [`get()`] combines the two and
//! builds the executor.
//!
//! Only the pip backend edits `pyproject.toml` itself. The other tools keep
//! the manifest's dependency tables up to date on their own.

mod pdm;
mod pip;
mod poetry;
mod uv;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CliError, Result};
use crate::manifest::{ManifestStore, Requirement};
use crate::process::{self, SpawnOptions};

pub use pdm::PdmExecutor;
pub use pip::PipExecutor;
pub use poetry::PoetryExecutor;
pub use uv::UvExecutor;

/// The environment managers nb-cli knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ManagerKind {
    Uv,
    Pdm,
    Poetry,
    Pip,
}

impl ManagerKind {
    pub const ALL: [ManagerKind; 4] = [
        ManagerKind::Uv,
        ManagerKind::Pdm,
        ManagerKind::Poetry,
        ManagerKind::Pip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ManagerKind::Uv => "uv",
            ManagerKind::Pdm => "pdm",
            ManagerKind::Poetry => "poetry",
            ManagerKind::Pip => "pip",
        }
    }

    /// The lock file whose presence marks a project as managed by this tool.
    /// pip has none and is the fallback.
    pub fn lock_file(self) -> Option<&'static str> {
        match self {
            ManagerKind::Uv => Some("uv.lock"),
            ManagerKind::Pdm => Some("pdm.lock"),
            ManagerKind::Poetry => Some("poetry.lock"),
            ManagerKind::Pip => None,
        }
    }

    /// Whether the tool's binary can be found on `PATH`.
    pub fn is_on_path(self) -> bool {
        which::which(self.as_str()).is_ok()
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerKind {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self> {
        ManagerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CliError::UnknownManager(s.to_string()))
    }
}

/// Operations every environment manager backend supports.
///
/// `extra_args` are forwarded verbatim to the underlying tool after the
/// requirements. Any non-zero exit becomes
/// [`CliError::ProcessExecutionError`].
#[async_trait]
pub trait EnvironmentExecutor: Send + Sync {
    fn kind(&self) -> ManagerKind;

    /// Set up a new environment in the project directory.
    async fn init(&self, extra_args: &[String]) -> Result<()>;

    /// Generate or refresh the lock file.
    async fn lock(&self, extra_args: &[String]) -> Result<()>;

    /// Bring the environment in line with the lock file or manifest.
    async fn sync(&self, extra_args: &[String]) -> Result<()>;

    /// Add `reqs` to the project, in the development group when `dev` is set.
    async fn install(&self, reqs: &[Requirement], extra_args: &[String], dev: bool)
    -> Result<()>;

    async fn update(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()>;

    async fn uninstall(&self, reqs: &[Requirement], extra_args: &[String]) -> Result<()>;
}

/// Infer `(current, available)` managers for a project.
///
/// `current` is the first manager whose lock file exists in `root`, or pip.
/// `available` is the first of `current, uv, pdm, poetry, pip` whose binary
/// is on `PATH`; when none is, `current` is returned unchanged.
pub fn probe(root: &Path) -> (ManagerKind, ManagerKind) {
    probe_with(root, ManagerKind::is_on_path)
}

fn probe_with(
    root: &Path,
    on_path: impl Fn(ManagerKind) -> bool,
) -> (ManagerKind, ManagerKind) {
    let current = ManagerKind::ALL
        .into_iter()
        .find(|kind| kind.lock_file().is_some_and(|lock| root.join(lock).exists()))
        .unwrap_or(ManagerKind::Pip);

    let available = std::iter::once(current)
        .chain(ManagerKind::ALL)
        .find(|kind| on_path(*kind))
        .unwrap_or(current);

    debug!(root = %root.display(), %current, %available, "probed environment manager");
    (current, available)
}

/// Every manager whose binary is on `PATH`, in preference order.
pub fn available_managers() -> Vec<ManagerKind> {
    ManagerKind::ALL
        .into_iter()
        .filter(|kind| kind.is_on_path())
        .collect()
}

/// Build the executor for `kind`.
///
/// `python` is the interpreter pip runs under. `manifest` is the store the
/// pip backend records dependency edits in; `None` leaves manifests alone.
pub fn executor(
    kind: ManagerKind,
    options: SpawnOptions,
    python: PathBuf,
    manifest: Option<ManifestStore>,
) -> Box<dyn EnvironmentExecutor> {
    match kind {
        ManagerKind::Uv => Box::new(UvExecutor::new(options)),
        ManagerKind::Pdm => Box::new(PdmExecutor::new(options)),
        ManagerKind::Poetry => Box::new(PoetryExecutor::new(options)),
        ManagerKind::Pip => Box::new(PipExecutor::new(python, options, manifest)),
    }
}

/// Executor for the project at `root`.
///
/// With no explicit `name` the manager is probed. A mismatch between the
/// project's manager and the one available is reported but not fatal.
pub fn get(
    name: Option<ManagerKind>,
    root: &Path,
    python: PathBuf,
    options: SpawnOptions,
) -> Box<dyn EnvironmentExecutor> {
    let kind = match name {
        Some(kind) => kind,
        None => {
            let (current, available) = probe(root);
            if current != available {
                eprintln!(
                    "Warning: The current project uses '{current}' but the available manager is '{available}'."
                );
            }
            available
        }
    };
    let options = SpawnOptions {
        cwd: Some(root.to_path_buf()),
        ..options
    };
    executor(kind, options, python, Some(ManifestStore::new(root)))
}

/// Locate a tool binary, falling back to the bare name so the spawn error
/// names what was missing.
fn tool_path(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// Command line `program verb... reqs... extra...`.
fn command_line(
    program: &Path,
    verb: &[&str],
    reqs: &[Requirement],
    extra_args: &[String],
) -> Vec<String> {
    let mut argv = Vec::with_capacity(1 + verb.len() + reqs.len() + extra_args.len());
    argv.push(program.to_string_lossy().into_owned());
    argv.extend(verb.iter().map(|v| v.to_string()));
    argv.extend(reqs.iter().map(Requirement::to_string));
    argv.extend(extra_args.iter().cloned());
    argv
}

/// `extra_args` with `--dev` appended when requested.
fn with_dev(extra_args: &[String], dev: bool) -> Vec<String> {
    let mut args = extra_args.to_vec();
    if dev {
        args.push("--dev".to_string());
    }
    args
}

/// Run `argv` to completion, promoting a non-zero exit to an error.
async fn run_checked(argv: &[String], options: &SpawnOptions) -> Result<()> {
    let code = process::run(argv, options).await?;
    if code != 0 {
        return Err(CliError::ProcessExecutionError {
            program: argv.first().cloned().unwrap_or_default(),
            code,
        });
    }
    Ok(())
}
