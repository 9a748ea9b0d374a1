// SPDX-License-Identifier: GPL-3.0-or-later

//! Facts about the Python interpreter a command runs against.
//!
//! Each probe runs a short `python -c` snippet that prints one JSON value.
//! Results are memoised per interpreter path for the rest of the process.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{CliError, Result};
use crate::process::{self, SpawnOptions};
use crate::project;
use crate::ttl_cache::TtlCache;

/// Oldest interpreter NoneBot runs on.
pub const REQUIRES_PYTHON: (u32, u32) = (3, 10);

const VERSION_SNIPPET: &str = "import json, sys; \
print(json.dumps({'major': sys.version_info[0], 'minor': sys.version_info[1]}))";

const DIST_VERSION_SNIPPET: &str = "import json, sys\n\
try:\n    from importlib.metadata import version\n    print(json.dumps(version(sys.argv[1])))\n\
except Exception:\n    print(json.dumps(None))\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub fn is_supported(self) -> bool {
        (self.major, self.minor) >= REQUIRES_PYTHON
    }
}

static VERSIONS: LazyLock<TtlCache<PathBuf, PythonVersion>> =
    LazyLock::new(|| TtlCache::new(None));
static DIST_VERSIONS: LazyLock<TtlCache<(PathBuf, &'static str), Option<String>>> =
    LazyLock::new(|| TtlCache::new(None));

/// Choose the interpreter: an explicit path, then the project's virtual
/// environment when `auto_venv` is set, then `python3`/`python` on `PATH`.
pub fn resolve_python(
    explicit: Option<&Path>,
    project_root: Option<&Path>,
    auto_venv: bool,
) -> Result<PathBuf> {
    if let Some(python) = explicit {
        return Ok(python.to_path_buf());
    }
    if auto_venv
        && let Some(root) = project_root
        && let Some(python) = project::detect_venv(root)
    {
        debug!(python = %python.display(), "using virtual environment interpreter");
        return Ok(python);
    }
    project::default_python().ok_or_else(|| {
        CliError::PythonInterpreter("no python interpreter found on PATH".to_string())
    })
}

pub async fn python_version(python: &Path) -> Result<PythonVersion> {
    VERSIONS
        .get_or_try_init(python.to_path_buf(), || {
            run_snippet(python, VERSION_SNIPPET, &[])
        })
        .await
}

/// Fail with [`CliError::PythonInterpreter`] unless the interpreter is new
/// enough.
pub async fn requires_python(python: &Path) -> Result<PythonVersion> {
    let version = python_version(python).await?;
    if !version.is_supported() {
        return Err(CliError::PythonInterpreter(format!(
            "Python {}.{} is not supported",
            version.major, version.minor
        )));
    }
    Ok(version)
}

/// Installed version of a distribution, `None` when it is not installed.
pub async fn dist_version(python: &Path, dist: &'static str) -> Result<Option<String>> {
    DIST_VERSIONS
        .get_or_try_init((python.to_path_buf(), dist), || async move {
            run_snippet(python, DIST_VERSION_SNIPPET, &[dist]).await
        })
        .await
}

pub async fn nonebot_version(python: &Path) -> Result<Option<String>> {
    dist_version(python, "nonebot2").await
}

pub async fn pip_version(python: &Path) -> Result<Option<String>> {
    dist_version(python, "pip").await
}

pub async fn requires_nonebot(python: &Path) -> Result<String> {
    requires_python(python).await?;
    nonebot_version(python)
        .await?
        .ok_or(CliError::NoneBotNotInstalled)
}

pub async fn requires_pip(python: &Path) -> Result<String> {
    requires_python(python).await?;
    pip_version(python).await?.ok_or(CliError::PipNotInstalled)
}

async fn run_snippet<T: DeserializeOwned>(python: &Path, code: &str, args: &[&str]) -> Result<T> {
    let mut argv = vec![
        python.as_os_str().to_owned(),
        "-W".into(),
        "ignore".into(),
        "-c".into(),
        code.into(),
    ];
    argv.extend(args.iter().map(Into::into));

    let (code, stdout) = process::output(&argv, &SpawnOptions::default())
        .await
        .map_err(|err| {
            CliError::PythonInterpreter(format!("failed to run {}: {err}", python.display()))
        })?;
    if code != 0 {
        return Err(CliError::PythonInterpreter(format!(
            "{} exited with code {code}",
            python.display()
        )));
    }
    Ok(serde_json::from_str(stdout.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_versions() {
        assert!(PythonVersion { major: 3, minor: 10 }.is_supported());
        assert!(PythonVersion { major: 3, minor: 13 }.is_supported());
        assert!(!PythonVersion { major: 3, minor: 9 }.is_supported());
        assert!(!PythonVersion { major: 2, minor: 7 }.is_supported());
    }

    #[test]
    fn explicit_interpreter_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let venv = tmp.path().join(".venv");
        std::fs::create_dir_all(&venv).unwrap();
        std::fs::write(venv.join(project::VENV_MARKER), "").unwrap();

        let explicit = Path::new("/opt/python/bin/python3.12");
        let python = resolve_python(Some(explicit), Some(tmp.path()), true).unwrap();
        assert_eq!(python, explicit);
    }

    #[test]
    fn venv_is_used_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let venv = tmp.path().join(".venv");
        std::fs::create_dir_all(&venv).unwrap();
        std::fs::write(venv.join(project::VENV_MARKER), "").unwrap();

        let python = resolve_python(None, Some(tmp.path()), true).unwrap();
        if cfg!(windows) {
            assert_eq!(python, venv.join("Scripts").join("python.exe"));
        } else {
            assert_eq!(python, venv.join("bin").join("python"));
        }

        if let Ok(python) = resolve_python(None, Some(tmp.path()), false) {
            assert!(!python.starts_with(tmp.path()));
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn probes_fake_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let _guard = crate::signals::tests_support::serial();
        let tmp = tempfile::tempdir().unwrap();
        let python = tmp.path().join("python");
        // Answers the version snippet and reports nonebot2 but not pip.
        std::fs::write(
            &python,
            "#!/bin/sh\n\
             case \"$5\" in\n\
               nonebot2) echo '\"2.4.0\"' ;;\n\
               pip) echo 'null' ;;\n\
               *) echo '{\"major\": 3, \"minor\": 9}' ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(
            python_version(&python).await.unwrap(),
            PythonVersion { major: 3, minor: 9 }
        );
        assert!(matches!(
            requires_python(&python).await,
            Err(CliError::PythonInterpreter(msg)) if msg.contains("3.9")
        ));
        assert_eq!(nonebot_version(&python).await.unwrap().as_deref(), Some("2.4.0"));
        assert_eq!(pip_version(&python).await.unwrap(), None);
    }
}
