// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The cache facade.
//!
//! [`CacheManager::get`] is cheap and synchronous: it derives the key and
//! returns a [`CacheEntry`]. [`CacheEntry::get_path`] does the work: probe
//! storage, and on a miss hand the request to the [`DownloadCoordinator`].
//! Every failure, including a malformed URI, comes back through
//! `get_path`'s `Result`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::OnceCell;
use url::Url;

use super::coordinator::{CoordinatorStats, DownloadCoordinator};
use super::key::{parse_uri, CacheKey, KeyDeriver};
use super::storage::{FileSystem, LocalFileSystem, StorageProbe, StoredEntry};
use super::transfer::Progress;
use crate::config::CacheConfig;
use crate::download::{Downloader, HttpDownloader};
use crate::error::{CacheError, CacheResult};
use crate::options::DownloadOptions;
use crate::sync::{resilient_read, resilient_write};

struct ManagerInner {
    deriver: KeyDeriver,
    probe: StorageProbe,
    coordinator: DownloadCoordinator,
    prepared: OnceCell<()>,
}

impl ManagerInner {
    /// First-miss setup: create the root and sweep abandoned partials.
    async fn prepare(&self) {
        let result = self
            .prepared
            .get_or_try_init(|| async {
                self.probe.ensure_root().await?;
                self.probe.sweep_partials().await?;
                Ok::<(), CacheError>(())
            })
            .await;
        if let Err(e) = result {
            // The transfer itself reports a root that cannot be created.
            tracing::warn!(root = %self.probe.root().display(), error = %e, "cache root preparation failed");
        }
    }
}

/// Entry point for resolving URIs to local files.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// A manager using the HTTP downloader and the local filesystem.
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        let downloader = HttpDownloader::with_connect_timeout(config.connect_timeout())?;
        Ok(Self::with_capabilities(config, Arc::new(downloader), Arc::new(LocalFileSystem)))
    }

    /// A manager with injected transport and filesystem.
    pub fn with_capabilities(
        config: &CacheConfig,
        downloader: Arc<dyn Downloader>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let probe = StorageProbe::new(fs, config.root.clone());
        let coordinator = DownloadCoordinator::new(
            downloader,
            probe.clone(),
            config.default_timeout(),
            config.cancel_orphaned,
        );
        Self {
            inner: Arc::new(ManagerInner {
                deriver: KeyDeriver::new(config.root.clone(), config.key_policy),
                probe,
                coordinator,
                prepared: OnceCell::new(),
            }),
        }
    }

    /// A handle for `uri`. Performs no I/O.
    pub fn get(&self, uri: &str, options: DownloadOptions) -> CacheEntry {
        let resolved = parse_uri(uri).and_then(|url| {
            let (key, path) = self.inner.deriver.derive_key(uri, &options)?;
            Ok(Resolved { url, key, path })
        });
        CacheEntry {
            manager: Arc::clone(&self.inner),
            uri: uri.to_string(),
            options,
            resolved,
            state: RwLock::new(EntryState::Unresolved),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.probe.root()
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.coordinator.stats()
    }

    /// Delete every completed entry. Returns the number removed.
    pub async fn clear(&self) -> CacheResult<usize> {
        let removed = self.inner.probe.clear().await?;
        tracing::info!(removed, root = %self.root().display(), "cache cleared");
        Ok(removed)
    }

    /// Total bytes held by completed entries.
    pub async fn size(&self) -> CacheResult<u64> {
        self.inner.probe.size().await
    }

    pub async fn entries(&self) -> CacheResult<Vec<StoredEntry>> {
        self.inner.probe.entries().await
    }

    /// Delete the entry for `uri`. Returns `false` if nothing was stored.
    pub async fn remove(&self, uri: &str, options: &DownloadOptions) -> CacheResult<bool> {
        let (_, path) = self.inner.deriver.derive_key(uri, options)?;
        self.inner.probe.remove(&path).await
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    url: Url,
    key: CacheKey,
    path: PathBuf,
}

/// Lifecycle of a [`CacheEntry`] as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Unresolved,
    Resolving,
    Ready(PathBuf),
    Failed(CacheError),
}

/// One logical resource. Holds its key, never its bytes.
pub struct CacheEntry {
    manager: Arc<ManagerInner>,
    uri: String,
    options: DownloadOptions,
    resolved: CacheResult<Resolved>,
    state: RwLock<EntryState>,
}

impl CacheEntry {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// `None` if the URI was invalid.
    pub fn key(&self) -> Option<&CacheKey> {
        self.resolved.as_ref().ok().map(|r| &r.key)
    }

    /// Where the file lives (or will live). `None` if the URI was invalid.
    pub fn target_path(&self) -> Option<&Path> {
        self.resolved.as_ref().ok().map(|r| r.path.as_path())
    }

    pub fn state(&self) -> EntryState {
        resilient_read(&self.state).clone()
    }

    /// Resolve to a local path, reporting progress along the way.
    ///
    /// A local hit reports a single complete progress value and touches no
    /// network. On a miss the entry joins or starts the transfer for its
    /// key. Never returns a partial file.
    pub async fn get_path<F>(&self, on_progress: F) -> CacheResult<PathBuf>
    where
        F: FnMut(Progress) + Send,
    {
        let result = match &self.resolved {
            Ok(resolved) => {
                self.set_state(EntryState::Resolving);
                self.resolve(resolved, on_progress).await
            }
            Err(e) => Err(e.clone()),
        };

        self.set_state(match &result {
            Ok(path) => EntryState::Ready(path.clone()),
            Err(e) => EntryState::Failed(e.clone()),
        });
        result
    }

    async fn resolve<F>(&self, resolved: &Resolved, mut on_progress: F) -> CacheResult<PathBuf>
    where
        F: FnMut(Progress) + Send,
    {
        let manager = &self.manager;

        if !self.options.refresh && manager.probe.exists(&resolved.path).await? {
            tracing::debug!(key = %resolved.key, "cache hit");
            on_progress(Progress::complete(0));
            return Ok(resolved.path.clone());
        }

        manager.prepare().await;
        let handle = manager.coordinator.request(
            resolved.key.clone(),
            resolved.url.clone(),
            self.options.clone(),
        );
        handle.wait(on_progress).await
    }

    fn set_state(&self, state: EntryState) {
        *resilient_write(&self.state) = state;
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("uri", &self.uri)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}
