// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local storage: the filesystem capability and the storage probe.
//!
//! The cache root is a flat directory. Presence of `<root>/<key>` is the
//! index; there is no metadata file. In-progress bytes live under
//! `<root>/.partial/` and are only renamed into the root once complete, so
//! a probe never sees a half-written entry.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::key::CacheKey;
use crate::error::{CacheError, CacheResult};

/// Directory under the root holding in-progress downloads.
pub const PARTIAL_DIR: &str = ".partial";

/// Partial files older than this are assumed abandoned by a dead process.
const PARTIAL_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// A regular file found in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Filesystem primitives the cache relies on.
///
/// All paths passed in are derived by the cache itself.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Whether a regular file exists at `path`. Not-found is `Ok(false)`.
    async fn exists(&self, path: &Path) -> CacheResult<bool>;

    /// Create `path` and any missing parents.
    async fn make_directory(&self, path: &Path) -> CacheResult<()>;

    /// Atomically move `from` to `to`, replacing `to` if present.
    async fn move_file(&self, from: &Path, to: &Path) -> CacheResult<()>;

    /// Remove a file. Returns `false` if it did not exist.
    async fn remove_file(&self, path: &Path) -> CacheResult<bool>;

    /// Regular files directly inside `dir`. A missing directory is empty.
    async fn list_files(&self, dir: &Path) -> CacheResult<Vec<FileInfo>>;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &Path) -> CacheResult<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::storage(format!("stat {}", path.display()), e)),
        }
    }

    async fn make_directory(&self, path: &Path) -> CacheResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| CacheError::write(format!("create directory {}", path.display()), e))
    }

    async fn move_file(&self, from: &Path, to: &Path) -> CacheResult<()> {
        tokio::fs::rename(from, to).await.map_err(|e| {
            CacheError::write(format!("move {} -> {}", from.display(), to.display()), e)
        })
    }

    async fn remove_file(&self, path: &Path) -> CacheResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::write(format!("remove {}", path.display()), e)),
        }
    }

    async fn list_files(&self, dir: &Path) -> CacheResult<Vec<FileInfo>> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::storage(format!("list {}", dir.display()), e)),
        };

        let mut files = Vec::new();
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(CacheError::storage(format!("list {}", dir.display()), e)),
            };
            // Entries can vanish between listing and stat; skip them.
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CacheError::storage(format!("stat {}", entry.path().display()), e)),
            };
            if !meta.is_file() {
                continue;
            }
            files.push(FileInfo {
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

/// A completed entry in the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEntry {
    pub file_name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Answers "is this key already on disk, and where".
#[derive(Clone)]
pub struct StorageProbe {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl StorageProbe {
    pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Final location of `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Stat-like check. Permission problems surface as `StorageUnavailable`.
    pub async fn exists(&self, path: &Path) -> CacheResult<bool> {
        self.fs.exists(path).await
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR)
    }

    /// A fresh, unique partial-file path for one transfer of `key`.
    pub fn partial_path_for(&self, key: &CacheKey) -> PathBuf {
        let suffix: u32 = rand::random();
        self.partial_dir()
            .join(format!("{}-{:08x}.part", key.digest(), suffix))
    }

    /// Create the root and partial directories.
    pub async fn ensure_root(&self) -> CacheResult<()> {
        self.fs.make_directory(&self.root).await?;
        self.fs.make_directory(&self.partial_dir()).await
    }

    /// Remove partial files abandoned by earlier processes.
    pub async fn sweep_partials(&self) -> CacheResult<usize> {
        let max_age = chrono::Duration::from_std(PARTIAL_MAX_AGE).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for file in self.fs.list_files(&self.partial_dir()).await? {
            let stale = file.modified.map(|m| m < cutoff).unwrap_or(true);
            if stale && self.fs.remove_file(&file.path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, root = %self.root.display(), "swept stale partial files");
        }
        Ok(removed)
    }

    /// Completed entries, sorted by file name.
    pub async fn entries(&self) -> CacheResult<Vec<StoredEntry>> {
        Ok(self
            .fs
            .list_files(&self.root)
            .await?
            .into_iter()
            .filter_map(|file| {
                let file_name = file.path.file_name()?.to_string_lossy().into_owned();
                Some(StoredEntry {
                    file_name,
                    size: file.size,
                    modified: file.modified,
                })
            })
            .collect())
    }

    /// Total bytes held by completed entries.
    pub async fn size(&self) -> CacheResult<u64> {
        Ok(self.entries().await?.iter().map(|e| e.size).sum())
    }

    /// Delete every completed entry and stale partials. Returns entries removed.
    ///
    /// Partial files of live transfers are left alone so those transfers
    /// can still complete.
    pub async fn clear(&self) -> CacheResult<usize> {
        let mut removed = 0;
        for file in self.fs.list_files(&self.root).await? {
            if self.fs.remove_file(&file.path).await? {
                removed += 1;
            }
        }
        self.sweep_partials().await?;
        Ok(removed)
    }

    /// Delete one entry. Returns `false` if nothing was stored.
    pub async fn remove(&self, path: &Path) -> CacheResult<bool> {
        self.fs.remove_file(path).await
    }
}
