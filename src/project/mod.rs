// SPDX-License-Identifier: GPL-3.0-or-later

//! Project discovery: the manifest-bearing root and its virtual environment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use tracing::debug;

use crate::error::{CliError, Result};

/// File that marks a project root.
pub const MANIFEST_FILE: &str = "pyproject.toml";

/// Marker file written by `venv`/`virtualenv` into every environment.
pub(crate) const VENV_MARKER: &str = "pyvenv.cfg";

#[cfg(windows)]
const DEFAULT_PYTHON: &[&str] = &["python"];
#[cfg(not(windows))]
const DEFAULT_PYTHON: &[&str] = &["python3", "python"];

static VENV_CACHE: LazyLock<Mutex<HashMap<PathBuf, Option<PathBuf>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Walk from `cwd` through its ancestors and return the first directory that
/// contains [`MANIFEST_FILE`].
pub fn find_project_root(cwd: &Path) -> Result<PathBuf> {
    let start = if cwd.is_absolute() {
        cwd.to_path_buf()
    } else {
        std::env::current_dir()?.join(cwd)
    };

    for dir in start.ancestors() {
        if dir.join(MANIFEST_FILE).is_file() {
            debug!(root = %dir.display(), "found project root");
            return Ok(dir.to_path_buf());
        }
    }

    Err(CliError::ProjectNotFound {
        searched_from: start,
    })
}

/// Interpreter of the first virtual environment directly under `root`.
///
/// Children are visited in name order so the answer is stable. The result is
/// memoised per root for the lifetime of the process.
pub fn detect_venv(root: &Path) -> Option<PathBuf> {
    let mut cache = VENV_CACHE.lock().unwrap_or_else(|p| p.into_inner());
    cache
        .entry(root.to_path_buf())
        .or_insert_with(|| scan_for_venv(root))
        .clone()
}

fn scan_for_venv(root: &Path) -> Option<PathBuf> {
    let mut children: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    children.sort();

    let venv = children
        .into_iter()
        .find(|dir| dir.join(VENV_MARKER).is_file())?;
    debug!(venv = %venv.display(), "detected virtual environment");
    Some(venv_python(&venv))
}

/// Path of the interpreter inside a virtual environment directory.
pub fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

/// First default interpreter name found on `PATH`.
pub fn default_python() -> Option<PathBuf> {
    DEFAULT_PYTHON
        .iter()
        .find_map(|name| which::which(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_manifest_in_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), "").unwrap();
        let nested = tmp.path().join("src").join("plugins");
        fs::create_dir_all(&nested).unwrap();

        let root = find_project_root(&nested).unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn nearest_manifest_wins() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), "").unwrap();
        let inner = tmp.path().join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join(MANIFEST_FILE), "").unwrap();

        assert_eq!(find_project_root(&inner).unwrap(), inner);
    }

    #[test]
    fn missing_manifest_is_project_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = find_project_root(tmp.path()).unwrap_err();
        assert!(matches!(err, CliError::ProjectNotFound { .. }));
    }

    #[test]
    fn detects_first_venv_child() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        let venv = tmp.path().join(".venv");
        fs::create_dir_all(&venv).unwrap();
        fs::write(venv.join(VENV_MARKER), "home = /usr/bin\n").unwrap();

        let python = detect_venv(tmp.path()).unwrap();
        assert!(python.starts_with(&venv));
        assert_eq!(python.parent().and_then(Path::parent), Some(venv.as_path()));
    }

    #[test]
    fn no_venv_when_marker_missing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("venv")).unwrap();
        assert_eq!(detect_venv(tmp.path()), None);
    }

    #[test]
    fn venv_detection_is_memoised() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(detect_venv(tmp.path()), None);

        let venv = tmp.path().join("env");
        fs::create_dir_all(&venv).unwrap();
        fs::write(venv.join(VENV_MARKER), "").unwrap();

        // The first answer sticks for this root.
        assert_eq!(detect_venv(tmp.path()), None);
    }
}
