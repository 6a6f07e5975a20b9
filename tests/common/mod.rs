// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use url::Url;

use uricache::download::ChunkCallback;
use uricache::cache::FileInfo;
use uricache::{
    CacheConfig, CacheError, CacheManager, CacheResult, DownloadOptions, Downloader, FileSystem,
    LocalFileSystem, NetworkError,
};

/// Upper bound for any single await in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory downloader with a scripted body.
///
/// The body is delivered in `chunks` pieces. When gated, the download pauses
/// after the first chunk until `gate` is notified, which lets a test hold a
/// transfer open while it attaches more waiters.
pub struct ScriptedDownloader {
    pub calls: AtomicUsize,
    pub started: Notify,
    pub gate: Notify,
    body: Vec<u8>,
    chunks: usize,
    report_total: bool,
    gated: bool,
    fail_at_chunk: Option<usize>,
    chunk_delay: Duration,
}

impl ScriptedDownloader {
    pub fn new(body_len: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            gate: Notify::new(),
            body: (0..body_len).map(|i| (i % 251) as u8).collect(),
            chunks: 2,
            report_total: true,
            gated: false,
            fail_at_chunk: None,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks.max(1);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn without_total(mut self) -> Self {
        self.report_total = false;
        self
    }

    /// Fail with a transport error instead of delivering chunk `index`.
    pub fn failing_at_chunk(mut self, index: usize) -> Self {
        self.fail_at_chunk = Some(index);
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Release a gated download.
    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    pub async fn wait_started(&self) {
        tokio::time::timeout(TEST_TIMEOUT, self.started.notified())
            .await
            .expect("download never started");
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn download(
        &self,
        _url: &Url,
        _options: &DownloadOptions,
        dest: &Path,
        on_chunk: &ChunkCallback,
    ) -> CacheResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let total = self.body.len() as u64;
        let expected = self.report_total.then_some(total);
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CacheError::write("create partial", e))?;
        on_chunk(0, expected);

        let chunk_size = ((self.body.len() + self.chunks - 1) / self.chunks).max(1);
        let mut written = 0u64;
        for (index, chunk) in self.body.chunks(chunk_size).enumerate() {
            if self.fail_at_chunk == Some(index) {
                return Err(NetworkError::Transport("connection reset by peer".into()).into());
            }
            file.write_all(chunk)
                .await
                .map_err(|e| CacheError::write("write partial", e))?;
            file.flush().await.map_err(|e| CacheError::write("flush partial", e))?;
            written += chunk.len() as u64;
            on_chunk(written, expected);

            if index == 0 {
                self.started.notify_one();
                if self.gated {
                    self.gate.notified().await;
                }
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        if self.body.is_empty() {
            self.started.notify_one();
        }
        Ok(dest.to_path_buf())
    }
}

/// Local filesystem with switchable failures.
#[derive(Default)]
pub struct FlakyFileSystem {
    pub fail_exists: bool,
    pub fail_move: bool,
    /// Report the first `exists` call as a miss, as if the file landed
    /// right after the caller looked.
    pub miss_first_probe: bool,
    pub probed: AtomicBool,
}

#[async_trait]
impl FileSystem for FlakyFileSystem {
    async fn exists(&self, path: &Path) -> CacheResult<bool> {
        if self.fail_exists {
            return Err(CacheError::StorageUnavailable(format!(
                "stat {}: permission denied",
                path.display()
            )));
        }
        if self.miss_first_probe && !self.probed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        LocalFileSystem.exists(path).await
    }

    async fn make_directory(&self, path: &Path) -> CacheResult<()> {
        LocalFileSystem.make_directory(path).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> CacheResult<()> {
        if self.fail_move {
            return Err(CacheError::Write(format!("move {}: no space left on device", from.display())));
        }
        LocalFileSystem.move_file(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> CacheResult<bool> {
        LocalFileSystem.remove_file(path).await
    }

    async fn list_files(&self, dir: &Path) -> CacheResult<Vec<FileInfo>> {
        LocalFileSystem.list_files(dir).await
    }
}

pub fn config(dir: &TempDir) -> CacheConfig {
    CacheConfig::with_root(dir.path().join("cache"))
}

pub fn manager(dir: &TempDir, downloader: &Arc<ScriptedDownloader>) -> CacheManager {
    manager_with(&config(dir), downloader, Arc::new(LocalFileSystem))
}

pub fn manager_with(
    config: &CacheConfig,
    downloader: &Arc<ScriptedDownloader>,
    fs: Arc<dyn FileSystem>,
) -> CacheManager {
    let downloader: Arc<dyn Downloader> = downloader.clone();
    CacheManager::with_capabilities(config, downloader, fs)
}

/// Files currently in the partial directory.
pub fn partial_files(dir: &TempDir) -> Vec<PathBuf> {
    match std::fs::read_dir(dir.path().join("cache").join(".partial")) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll `cond` until it holds or the test timeout expires.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
