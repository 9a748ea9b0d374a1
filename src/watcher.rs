// SPDX-License-Identifier: GPL-3.0-or-later

//! Source-file filtering and recursive change watching for the reloader.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

const DEFAULT_INCLUDES: &[&str] = &["*.py"];
const DEFAULT_EXCLUDES: &[&str] = &[".*", ".py[cod]", ".sw.*", "~*"];

/// Events arriving this close together are reported as one batch.
const BATCH_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

pub type Change = (ChangeKind, PathBuf);

/// A glob applied to the trailing components of a path, the way Python's
/// `PurePath.match` does: `*.py` looks at the file name only, `src/*.py` at
/// the last two components, and an absolute pattern at the whole path.
#[derive(Debug, Clone)]
struct PathGlob {
    raw: String,
    absolute: bool,
    parts: Vec<Pattern>,
}

impl PathGlob {
    fn new(raw: &str) -> Option<Self> {
        let absolute = Path::new(raw).has_root();
        let parts: std::result::Result<Vec<Pattern>, _> = raw
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .map(Pattern::new)
            .collect();
        match parts {
            Ok(parts) if !parts.is_empty() => Some(Self {
                raw: raw.to_string(),
                absolute,
                parts,
            }),
            Ok(_) => None,
            Err(err) => {
                warn!(pattern = raw, %err, "ignoring invalid watch pattern");
                None
            }
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: !cfg!(windows),
            ..MatchOptions::new()
        };
        let names: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        if names.len() < self.parts.len() || (self.absolute && names.len() != self.parts.len()) {
            return false;
        }
        let tail = &names[names.len() - self.parts.len()..];
        self.parts
            .iter()
            .zip(tail)
            .all(|(pattern, name)| pattern.matches_with(name, options))
    }
}

/// Decides which changed paths are worth a restart.
#[derive(Debug, Clone)]
pub struct FileFilter {
    includes: Vec<PathGlob>,
    excludes: Vec<PathGlob>,
    exclude_dirs: Vec<PathBuf>,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::new(&[], &[], Path::new("."))
    }
}

impl FileFilter {
    /// Build a filter from user globs.
    ///
    /// Includes are `*.py` plus `includes`, minus `*.py` when it is excluded.
    /// Excludes are the hidden/bytecode/swap defaults plus `excludes`; an
    /// exclude naming an existing directory (relative to `base`) excludes
    /// everything beneath it instead of acting as a glob.
    pub fn new(includes: &[String], excludes: &[String], base: &Path) -> Self {
        let mut include_set: BTreeSet<&str> = DEFAULT_INCLUDES
            .iter()
            .copied()
            .filter(|default| !excludes.iter().any(|e| e == default))
            .collect();
        include_set.extend(includes.iter().map(String::as_str));

        let mut exclude_set: BTreeSet<&str> = DEFAULT_EXCLUDES.iter().copied().collect();
        let mut exclude_dirs = Vec::new();
        for exclude in excludes {
            let dir = base.join(exclude);
            if dir.is_dir() {
                exclude_dirs.push(absolute(&dir));
            } else {
                exclude_set.insert(exclude);
            }
        }

        Self {
            includes: include_set.into_iter().filter_map(PathGlob::new).collect(),
            excludes: exclude_set.into_iter().filter_map(PathGlob::new).collect(),
            exclude_dirs,
        }
    }

    /// Exclude every path under `dirs` as well.
    pub fn with_exclude_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.exclude_dirs.extend(dirs.into_iter().map(|d| absolute(&d)));
        self
    }

    pub fn include_patterns(&self) -> impl Iterator<Item = &str> {
        self.includes.iter().map(|g| g.raw.as_str())
    }

    pub fn exclude_patterns(&self) -> impl Iterator<Item = &str> {
        self.excludes.iter().map(|g| g.raw.as_str())
    }

    pub fn matches(&self, path: &Path) -> bool {
        if !self.includes.iter().any(|glob| glob.matches(path)) {
            return false;
        }
        if self
            .exclude_dirs
            .iter()
            .any(|dir| path != dir && path.starts_with(dir))
        {
            return false;
        }
        !self.excludes.iter().any(|glob| glob.matches(path))
    }

    /// Unique paths of `batch` that pass the filter, in path order.
    pub fn filter_batch(&self, batch: &[Change]) -> Vec<PathBuf> {
        batch
            .iter()
            .map(|(_, path)| path.as_path())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|path| self.matches(path))
            .map(Path::to_path_buf)
            .collect()
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Directories to watch: `dirs` (relative to `root`) followed by `root`.
///
/// Nested directories collapse into their outermost ancestor, so no path is
/// watched twice.
pub fn watch_roots(dirs: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    let root = absolute(root);
    let candidates = dirs
        .iter()
        .map(|dir| absolute(&root.join(dir)))
        .chain(std::iter::once(root.clone()));

    let mut roots: Vec<PathBuf> = Vec::new();
    for dir in candidates {
        if roots.iter().any(|kept| dir.starts_with(kept)) {
            continue;
        }
        roots.retain(|kept| !kept.starts_with(&dir));
        roots.push(dir);
    }
    roots
}

/// A stream of change batches.
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next batch. `None` once the source is closed.
    async fn next_batch(&mut self) -> Option<Vec<Change>>;

    /// Throw away whatever has queued up without waiting.
    fn drain(&mut self) {}
}

/// Recursive filesystem watcher over a set of roots.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
}

impl FsWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        for root in &roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "watching");
        }
        Ok(Self {
            _watcher: watcher,
            rx,
            roots,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

#[async_trait]
impl ChangeSource for FsWatcher {
    async fn next_batch(&mut self) -> Option<Vec<Change>> {
        let mut batch = Vec::new();
        loop {
            let event = if batch.is_empty() {
                self.rx.recv().await?
            } else {
                match tokio::time::timeout(BATCH_WINDOW, self.rx.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) | Err(_) => break,
                }
            };
            match event {
                Ok(event) => batch.extend(changes(&event)),
                Err(err) => warn!(%err, "file watcher error"),
            }
        }
        debug!(changes = batch.len(), "file watcher batch");
        Some(batch)
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

fn changes(event: &Event) -> Vec<Change> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => return Vec::new(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modified,
    };
    event.paths.iter().map(|p| (kind, p.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(includes: &[&str], excludes: &[&str], base: &Path) -> FileFilter {
        let includes: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        FileFilter::new(&includes, &excludes, base)
    }

    #[test]
    fn default_filter_admits_python_sources_only() {
        let f = FileFilter::default();
        assert!(f.matches(Path::new("/bot/src/app.py")));
        assert!(!f.matches(Path::new("/bot/src/app.pyc")));
        assert!(!f.matches(Path::new("/bot/src/.hidden.py")));
        assert!(!f.matches(Path::new("/bot/src/~scratch.py")));
        assert!(!f.matches(Path::new("/bot/README.md")));
    }

    #[test]
    fn exclude_only_filter_still_admits_python() {
        let tmp = tempfile::tempdir().unwrap();
        let f = filter(&[], &["*_test.py"], tmp.path());
        assert_eq!(f.include_patterns().collect::<Vec<_>>(), ["*.py"]);
        assert!(f.matches(Path::new("/bot/app.py")));
        assert!(!f.matches(Path::new("/bot/app_test.py")));
    }

    #[test]
    fn excluding_default_include_removes_it() {
        let tmp = tempfile::tempdir().unwrap();
        let f = filter(&["*.toml"], &["*.py"], tmp.path());
        assert!(!f.matches(Path::new("/bot/app.py")));
        assert!(f.matches(Path::new("/bot/pyproject.toml")));
    }

    #[test]
    fn existing_directory_excludes_its_subtree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("data")).unwrap();
        let f = filter(&[], &["data"], tmp.path());
        let root = tmp.path().canonicalize().unwrap();

        assert!(!f.matches(&root.join("data").join("cache.py")));
        assert!(f.matches(&root.join("src").join("data.py")));
        assert!(!f.exclude_patterns().any(|p| p == "data"));
    }

    #[test]
    fn multi_component_patterns_match_from_the_right() {
        let tmp = tempfile::tempdir().unwrap();
        let f = filter(&[], &["migrations/*.py"], tmp.path());
        assert!(!f.matches(Path::new("/bot/db/migrations/0001.py")));
        assert!(f.matches(Path::new("/bot/db/models.py")));
    }

    #[test]
    fn batch_filter_dedupes_paths() {
        let f = FileFilter::default();
        let batch = vec![
            (ChangeKind::Modified, PathBuf::from("/bot/app.py")),
            (ChangeKind::Modified, PathBuf::from("/bot/app.py")),
            (ChangeKind::Added, PathBuf::from("/bot/.app.py.swp")),
        ];
        assert_eq!(f.filter_batch(&batch), [PathBuf::from("/bot/app.py")]);
    }

    #[test]
    fn roots_inside_project_collapse_into_it() {
        let project = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join("src")).unwrap();

        let roots = watch_roots(
            &[
                PathBuf::from("src"),
                outside.path().to_path_buf(),
                outside.path().to_path_buf(),
            ],
            project.path(),
        );
        assert_eq!(
            roots,
            [
                outside.path().canonicalize().unwrap(),
                project.path().canonicalize().unwrap(),
            ]
        );
    }

    #[test]
    fn parent_dir_replaces_project_root() {
        let parent = tempfile::tempdir().unwrap();
        let project = parent.path().join("bot");
        std::fs::create_dir_all(project.join("src")).unwrap();

        let roots = watch_roots(&[PathBuf::from("src"), PathBuf::from("..")], &project);
        assert_eq!(roots, [parent.path().canonicalize().unwrap()]);
    }

    #[tokio::test]
    async fn fs_watcher_reports_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let mut watcher = FsWatcher::new(vec![root.clone()]).unwrap();
        assert_eq!(watcher.roots(), [root.clone()]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(root.join("bot.py"), "print('hi')\n").unwrap();

        let target = root.join("bot.py");
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let batch = watcher.next_batch().await.unwrap();
                if batch.iter().any(|(_, p)| *p == target) {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(found);
    }
}
