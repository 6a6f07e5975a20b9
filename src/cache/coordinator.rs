// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-flight download coordination.
//!
//! The coordinator owns the only process-wide mutable state in the cache:
//! the table mapping a [`CacheKey`] to its live [`Transfer`]. Looking up an
//! existing transfer and inserting a new one happen under one write lock,
//! so two concurrent requests for a key can never both start a download.
//!
//! Each transfer is driven by its own tokio task:
//!
//! 1. `Pending`: re-probe storage. Another transfer may have finished
//!    between the caller's probe and this request.
//! 2. `InFlight`: the downloader writes to `<root>/.partial/…`, reporting
//!    chunks that are fanned out to waiters.
//! 3. On success the partial file is renamed to `<root>/<key>`; on failure
//!    it is deleted. The transfer leaves the table and every waiter gets the
//!    same outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use url::Url;

use super::key::CacheKey;
use super::storage::StorageProbe;
use super::transfer::{Progress, Transfer, TransferHandle};
use crate::download::Downloader;
use crate::error::{CacheError, CacheResult, NetworkError};
use crate::options::DownloadOptions;
use crate::sync::{resilient_read, resilient_write};

/// Counters since the coordinator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Transfers created.
    pub started: u64,
    /// Requests that joined an existing transfer.
    pub joined: u64,
    /// Downloader invocations.
    pub downloads: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    joined: AtomicU64,
    downloads: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    transfers: RwLock<HashMap<CacheKey, Arc<Transfer>>>,
    downloader: Arc<dyn Downloader>,
    probe: StorageProbe,
    default_timeout: Option<Duration>,
    cancel_orphaned: bool,
    counters: Counters,
}

/// Deduplicates concurrent downloads by key.
#[derive(Clone)]
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        probe: StorageProbe,
        default_timeout: Option<Duration>,
        cancel_orphaned: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transfers: RwLock::new(HashMap::new()),
                downloader,
                probe,
                default_timeout,
                cancel_orphaned,
                counters: Counters::default(),
            }),
        }
    }

    /// Attach to the live transfer for `key`, or start one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, key: CacheKey, url: Url, options: DownloadOptions) -> TransferHandle {
        let shared = &self.shared;
        let mut table = resilient_write(&shared.transfers);

        if let Some(existing) = table.get(&key) {
            if let Some(handle) = existing.attach(shared.cancel_orphaned) {
                shared.counters.joined.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, waiters = existing.waiter_count(), "joined in-flight transfer");
                return handle;
            }
            tracing::debug!(key = %key, "replacing cancelled transfer");
        }

        let (transfer, handle) = Transfer::start(key.clone(), shared.cancel_orphaned);
        table.insert(key.clone(), Arc::clone(&transfer));
        drop(table);

        shared.counters.started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, url = %url, "starting transfer");

        let driver = tokio::spawn(drive(Arc::clone(shared), Arc::clone(&transfer), url, options));
        let supervisor_shared = Arc::clone(shared);
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                tracing::error!(key = %transfer.key(), error = %e, "transfer task aborted");
                let outcome = if e.is_cancelled() {
                    Err(CacheError::Cancelled)
                } else {
                    Err(NetworkError::Transport(format!("transfer task failed: {}", e)).into())
                };
                complete(&supervisor_shared, &transfer, outcome);
            }
        });

        handle
    }

    /// Whether a transfer for `key` is currently live.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        resilient_read(&self.shared.transfers).contains_key(key)
    }

    /// Number of live transfers.
    pub fn in_flight(&self) -> usize {
        resilient_read(&self.shared.transfers).len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.shared.counters;
        CoordinatorStats {
            started: c.started.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            downloads: c.downloads.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

async fn drive(shared: Arc<Shared>, transfer: Arc<Transfer>, url: Url, options: DownloadOptions) {
    let outcome = run_transfer(&shared, &transfer, &url, &options).await;
    complete(&shared, &transfer, outcome);
}

async fn run_transfer(
    shared: &Shared,
    transfer: &Arc<Transfer>,
    url: &Url,
    options: &DownloadOptions,
) -> CacheResult<PathBuf> {
    let probe = &shared.probe;
    let key = transfer.key();
    let target = probe.path_for(key);

    if !options.refresh && probe.exists(&target).await? {
        tracing::debug!(key = %key, "found in storage while pending");
        return Ok(target);
    }

    probe.ensure_root().await?;
    let partial = probe.partial_path_for(key);
    transfer.set_in_flight();
    shared.counters.downloads.fetch_add(1, Ordering::Relaxed);

    let reporter = {
        let transfer = Arc::clone(transfer);
        move |written: u64, expected: Option<u64>| transfer.report(Progress::new(written, expected))
    };

    let fetch = shared.downloader.download(url, options, &partial, &reporter);
    let timeout = options.timeout.or(shared.default_timeout);

    let result = tokio::select! {
        _ = transfer.cancellation().cancelled() => Err(CacheError::Cancelled),
        r = with_timeout(fetch, timeout) => r,
    };

    let outcome = match result {
        Ok(written) => probe.fs().move_file(&written, &target).await.map(|()| target),
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        if let Err(e) = probe.fs().remove_file(&partial).await {
            tracing::warn!(key = %key, path = %partial.display(), error = %e, "failed to remove partial file");
        }
    }
    outcome
}

async fn with_timeout<F>(fetch: F, timeout: Option<Duration>) -> CacheResult<PathBuf>
where
    F: std::future::Future<Output = CacheResult<PathBuf>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fetch).await.unwrap_or_else(|_| {
            Err(NetworkError::Timeout { after: limit }.into())
        }),
        None => fetch.await,
    }
}

/// Remove `transfer` from the table and deliver `outcome` to its waiters.
///
/// Both happen under the table lock, so a request racing with completion
/// either joins before removal (and receives the outcome) or starts fresh.
fn complete(shared: &Shared, transfer: &Arc<Transfer>, outcome: CacheResult<PathBuf>) {
    let key = transfer.key();
    let mut table = resilient_write(&shared.transfers);
    if table.get(key).map(|t| Arc::ptr_eq(t, transfer)).unwrap_or(false) {
        table.remove(key);
    }

    match &outcome {
        Ok(path) => {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(key = %key, path = %path.display(), "transfer completed");
        }
        Err(CacheError::Cancelled) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "transfer cancelled");
        }
        Err(e) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %key, error = %e, "transfer failed");
        }
    }

    transfer.finish(outcome);
}
