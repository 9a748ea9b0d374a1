// SPDX-License-Identifier: GPL-3.0-or-later

//! Launching the bot: a one-shot run, or the launcher the reloader drives.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::manifest::NoneBotConfig;
use crate::process::{self, ChildProcess, SpawnOptions};
use crate::reloader::BotLauncher;

/// Entry file looked up in the project root before falling back to a
/// generated script.
pub const DEFAULT_ENTRY: &str = "bot.py";

/// Python bootstrap equivalent to a minimal `bot.py` for this manifest.
pub fn generate_script(config: &NoneBotConfig) -> String {
    let mut script = String::from("import importlib\n\nimport nonebot\n\nnonebot.init()\n");
    let adapters = config.adapters();
    if !adapters.is_empty() {
        script.push_str("\ndriver = nonebot.get_driver()\n");
        for adapter in adapters {
            let _ = writeln!(
                script,
                "driver.register_adapter(importlib.import_module({}).Adapter)",
                py_str(&adapter.module_name)
            );
        }
    }
    if !config.builtin_plugins().is_empty() {
        script.push('\n');
        for plugin in config.builtin_plugins() {
            let _ = writeln!(script, "nonebot.load_builtin_plugin({})", py_str(plugin));
        }
    }
    script.push_str("\nnonebot.load_from_toml(\"pyproject.toml\")\n\nnonebot.run()\n");
    script
}

/// JSON string literals are valid Python string literals.
fn py_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// What the interpreter is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEntry {
    File(PathBuf),
    Script(String),
}

impl BotEntry {
    /// `file` under `root` when it exists, otherwise a script generated from
    /// `config`.
    pub fn resolve(root: &Path, file: &str, config: &NoneBotConfig) -> Self {
        let path = root.join(file);
        if path.is_file() {
            BotEntry::File(path)
        } else {
            debug!(entry = %path.display(), "entry file missing, using generated script");
            BotEntry::Script(generate_script(config))
        }
    }

    pub fn argv(&self, python: &Path, args: &[String]) -> Vec<OsString> {
        let mut argv = vec![python.as_os_str().to_owned()];
        match self {
            BotEntry::File(path) => argv.push(path.as_os_str().to_owned()),
            BotEntry::Script(script) => {
                argv.push("-c".into());
                argv.push(script.into());
            }
        }
        argv.extend(args.iter().map(Into::into));
        argv
    }
}

/// Spawns the bot with a fixed interpreter, entry and arguments.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    python: PathBuf,
    entry: BotEntry,
    args: Vec<String>,
    options: SpawnOptions,
}

impl ProcessLauncher {
    pub fn new(python: PathBuf, entry: BotEntry, args: Vec<String>, root: &Path) -> Self {
        Self {
            python,
            entry,
            args,
            options: SpawnOptions::in_dir(root),
        }
    }

    pub fn spawn(&self) -> Result<ChildProcess> {
        process::spawn(&self.entry.argv(&self.python, &self.args), &self.options)
    }
}

#[async_trait]
impl BotLauncher for ProcessLauncher {
    async fn startup(&mut self) -> Result<ChildProcess> {
        self.spawn()
    }

    async fn shutdown(&mut self, child: &mut ChildProcess) -> Result<()> {
        let code = child.terminate().await;
        debug!(code, "bot stopped");
        Ok(())
    }
}

/// Run the bot to completion and return its exit code. Host signals reach
/// the child through the process wrapper.
pub async fn run_once(launcher: &ProcessLauncher) -> Result<i32> {
    let mut child = launcher.spawn()?;
    Ok(child.wait().await)
}
