// SPDX-License-Identifier: GPL-3.0-or-later

//! Client for the module registry.
//!
//! The registry publishes one JSON catalog per [`ModuleKind`]. The same file
//! is served by the primary registry and by several CDN and proxy mirrors;
//! [`RegistryClient::load`] races all of them and keeps the first healthy
//! answer, dropping the other requests.
//!
//! Catalogs are cached twice: on disk under the cache directory, where a
//! file younger than the configured maximum age is used without touching the
//! network, and in memory for the rest of the process.
//!
//! Next to every catalog lives an "unpublished" catalog holding packages the
//! user installed by distribution name although the registry does not list
//! them. Those are only merged into listings on request.

mod model;

pub use model::{ModuleKind, Package, Tag, Validity};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{debug, warn};

use crate::error::{CliError, Result};
use crate::ttl_cache::TtlCache;

/// Default catalog locations. `{kind}` is replaced by the singular kind name.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://registry.nonebot.dev/{kind}s.json",
    "https://cdn.jsdelivr.net/gh/nonebot/registry@results/{kind}s.json",
    "https://cdn.staticaly.com/gh/nonebot/registry@results/{kind}s.json",
    "https://jsd.cdn.zzko.cn/gh/nonebot/registry@results/{kind}s.json",
    "https://mirror.ghproxy.com/https://raw.githubusercontent.com/nonebot/registry/results/{kind}s.json",
    "https://gh-proxy.com/https://raw.githubusercontent.com/nonebot/registry/results/{kind}s.json",
];

pub type Catalog = Arc<Vec<Package>>;

/// Sizes in bytes of the cached files for one kind; `None` when the file is
/// missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub kind: ModuleKind,
    pub current: Option<u64>,
    pub unpublished: Option<u64>,
}

impl CacheStatus {
    pub fn total(&self) -> Option<u64> {
        match (self.current, self.unpublished) {
            (None, None) => None,
            (current, unpublished) => {
                Some(current.unwrap_or(0).saturating_add(unpublished.unwrap_or(0)))
            }
        }
    }
}

pub struct RegistryClient {
    mirrors: Vec<String>,
    cache_dir: PathBuf,
    max_age: Duration,
    http: reqwest::Client,
    memo: TtlCache<ModuleKind, Catalog>,
}

impl RegistryClient {
    pub fn new(mirrors: Vec<String>, cache_dir: PathBuf, max_age: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("nb-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            mirrors,
            cache_dir,
            max_age,
            http,
            memo: TtlCache::new(None),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_path(&self, kind: ModuleKind) -> PathBuf {
        self.cache_dir.join(format!("{}.json", kind.plural()))
    }

    pub fn unpublished_path(&self, kind: ModuleKind) -> PathBuf {
        self.cache_dir.join(format!("{}_unpublished.json", kind.plural()))
    }

    /// The catalog for `kind`, from memory, disk or the mirrors in that order.
    pub async fn load(&self, kind: ModuleKind) -> Result<Catalog> {
        self.memo
            .get_or_try_init(kind, || self.load_uncached(kind))
            .await
    }

    /// Fetch `kind` from the mirrors regardless of any cached copy.
    pub async fn refresh(&self, kind: ModuleKind) -> Result<Catalog> {
        self.memo.invalidate(&kind);
        self.memo
            .get_or_try_init(kind, || async move {
                Ok(Arc::new(self.download(kind).await?))
            })
            .await
    }

    /// Catalog entries, optionally merged with the unpublished catalog and
    /// filtered by a case-insensitive query.
    pub async fn list(
        &self,
        kind: ModuleKind,
        query: Option<&str>,
        include_unpublished: bool,
    ) -> Result<Vec<Package>> {
        let mut packages = self.load(kind).await?.as_ref().clone();
        if include_unpublished {
            for pkg in self.load_unpublished(kind).await? {
                if !packages.contains(&pkg) {
                    packages.push(pkg);
                }
            }
        }
        if let Some(query) = query {
            packages.retain(|pkg| pkg.matches(query));
        }
        Ok(packages)
    }

    pub async fn load_unpublished(&self, kind: ModuleKind) -> Result<Vec<Package>> {
        let path = self.unpublished_path(kind);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Add `pkg` to the unpublished catalog of `kind` unless already there.
    pub async fn remember_unpublished(&self, kind: ModuleKind, pkg: &Package) -> Result<()> {
        let mut packages = self.load_unpublished(kind).await?;
        if packages.contains(pkg) {
            return Ok(());
        }
        packages.push(pkg.clone());
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let body = serde_json::to_vec_pretty(&packages)?;
        tokio::fs::write(self.unpublished_path(kind), body).await?;
        debug!(%kind, module = %pkg.module_name, "remembered unpublished package");
        Ok(())
    }

    /// Delete every cached catalog and forget the in-memory copies.
    pub async fn clear(&self) -> Result<()> {
        for kind in ModuleKind::ALL {
            remove_if_exists(&self.cache_path(kind)).await?;
            remove_if_exists(&self.unpublished_path(kind)).await?;
        }
        self.memo.clear();
        Ok(())
    }

    /// Delete only the unpublished catalogs.
    pub async fn clear_unpublished(&self) -> Result<()> {
        for kind in ModuleKind::ALL {
            remove_if_exists(&self.unpublished_path(kind)).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Vec<CacheStatus> {
        let mut out = Vec::with_capacity(ModuleKind::ALL.len());
        for kind in ModuleKind::ALL {
            out.push(CacheStatus {
                kind,
                current: file_size(&self.cache_path(kind)).await,
                unpublished: file_size(&self.unpublished_path(kind)).await,
            });
        }
        out
    }

    async fn load_uncached(&self, kind: ModuleKind) -> Result<Catalog> {
        let path = self.cache_path(kind);
        let cached = read_cached(&path).await;

        if let Some((packages, age)) = &cached
            && *age < self.max_age
        {
            debug!(%kind, path = %path.display(), "using cached catalog");
            return Ok(Arc::new(packages.clone()));
        }

        match self.download(kind).await {
            Ok(packages) => Ok(Arc::new(packages)),
            Err(err) => match cached {
                Some((packages, _)) => {
                    warn!("failed to refresh the {kind} list, expired cache is used: {err}");
                    Ok(Arc::new(packages))
                }
                None => Err(err),
            },
        }
    }

    /// Race every mirror and write the winning body to the cache file.
    async fn download(&self, kind: ModuleKind) -> Result<Vec<Package>> {
        let urls: Vec<String> = self
            .mirrors
            .iter()
            .map(|template| template.replace("{kind}", kind.as_str()))
            .collect();

        let mut pending: FuturesUnordered<_> = urls
            .iter()
            .map(|url| async move {
                debug!(%url, "fetching catalog");
                (url, self.fetch(url).await)
            })
            .collect();

        let mut causes = Vec::new();
        while let Some((url, result)) = pending.next().await {
            match result {
                Ok((body, packages)) => {
                    drop(pending);
                    debug!(%url, count = packages.len(), "catalog fetched");
                    tokio::fs::create_dir_all(&self.cache_dir).await?;
                    tokio::fs::write(self.cache_path(kind), body).await?;
                    return Ok(packages);
                }
                Err(cause) => {
                    debug!(%url, %cause, "mirror failed");
                    causes.push((url.clone(), cause));
                }
            }
        }

        Err(CliError::ModuleLoadFailed {
            kind: kind.to_string(),
            causes,
        })
    }

    async fn fetch(&self, url: &str) -> std::result::Result<(Vec<u8>, Vec<Package>), String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(format!("HTTP {status}"));
        }
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        let packages: Vec<Package> =
            serde_json::from_slice(&body).map_err(|e| format!("invalid catalog: {e}"))?;
        Ok((body.to_vec(), packages))
    }
}

/// Parsed cache file and its age. Missing or corrupt files yield `None`.
async fn read_cached(path: &Path) -> Option<(Vec<Package>, Duration)> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let packages = match serde_json::from_slice(&bytes) {
        Ok(packages) => packages,
        Err(err) => {
            debug!(path = %path.display(), %err, "ignoring corrupt cache file");
            return None;
        }
    };
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Some((packages, age))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Pick the one package `query` refers to.
///
/// An exact match on import path, distribution or display name wins;
/// otherwise the query must be a case-insensitive substring of exactly one
/// of those fields across all candidates.
pub fn find_exact_package<'a>(query: &str, candidates: &'a [Package]) -> Result<&'a Package> {
    if let Some(pkg) = candidates
        .iter()
        .find(|p| p.module_name == query || p.project_link == query || p.name == query)
    {
        return Ok(pkg);
    }

    let needle = query.to_lowercase();
    let mut fuzzy = candidates.iter().filter(|p| {
        [&p.module_name, &p.project_link, &p.name]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    });
    match (fuzzy.next(), fuzzy.next()) {
        (Some(pkg), None) => Ok(pkg),
        _ => Err(CliError::NoSelectablePackage(query.to_string())),
    }
}
