// SPDX-License-Identifier: GPL-3.0-or-later

//! Error taxonomy shared by every core module.
//!
//! The binary converts these into `anyhow::Error` at the command boundary and
//! downcasts them again to pick an exit code and a user-facing message.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("no pyproject.toml found in {} or any parent directory", searched_from.display())]
    ProjectNotFound { searched_from: PathBuf },

    #[error("invalid project manifest: {0}")]
    ProjectInvalid(String),

    #[error("failed to load {kind} list from every mirror:{}", format_causes(causes))]
    ModuleLoadFailed {
        kind: String,
        causes: Vec<(String, String)>,
    },

    #[error("{program} exited with code {code}")]
    ProcessExecutionError { program: String, code: i32 },

    #[error("{0}")]
    PythonInterpreter(String),

    #[error("NoneBot is not installed in the selected environment")]
    NoneBotNotInstalled,

    #[error("pip is not installed in the selected environment")]
    PipNotInstalled,

    #[error("no package matches {0:?}")]
    NoSelectablePackage(String),

    #[error("unknown environment manager: {0}")]
    UnknownManager(String),

    #[error("invalid requirement {input:?}: {reason}")]
    InvalidRequirement { input: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml_edit::TomlError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl CliError {
    /// Exit code of a failed child process, if this error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CliError::ProcessExecutionError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn format_causes(causes: &[(String, String)]) -> String {
    causes
        .iter()
        .map(|(url, cause)| format!("\n  {url}: {cause}"))
        .collect()
}
