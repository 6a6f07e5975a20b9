// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for uricache
//!
//! These tests hammer the single-flight coordinator from many tasks on a
//! multi-threaded runtime. They are designed to surface data races when run
//! with ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Many waiters on one key
//! - Many keys at once
//! - Requests racing with completion
//! - Waiters detaching mid-transfer

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tempfile::TempDir;
use tokio::time::timeout;

use common::{eventually, manager, partial_files, ScriptedDownloader};
use uricache::{DownloadOptions, Progress};

// Test configuration
const CONCURRENCY_LEVEL: usize = 100;
const TEST_TIMEOUT_SECS: u64 = 30;

fn is_suffix(short: &[f64], long: &[f64]) -> bool {
    short.len() <= long.len() && long[long.len() - short.len()..] == *short
}

// =============================================================================
// ONE KEY, MANY WAITERS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_waiters_one_download() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new(1000).chunks(10).gated());
    let cache = manager(&dir, &downloader);
    let uri = "https://cdn.example.com/hero.jpg";

    let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
    for _ in 0..CONCURRENCY_LEVEL {
        let entry = cache.get(uri, DownloadOptions::new());
        handles.push(tokio::spawn(async move {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let result = entry
                .get_path(move |p: Progress| sink.lock().unwrap().push(p.fraction().unwrap_or(-1.0)))
                .await;
            let seen = seen.lock().unwrap().clone();
            (result, seen)
        }));
    }

    // Hold the transfer open until every request has attached.
    downloader.wait_started().await;
    let coordinator = cache.coordinator().clone();
    assert!(
        eventually(|| coordinator.stats().joined == CONCURRENCY_LEVEL as u64 - 1).await,
        "not every request joined: {:?}",
        coordinator.stats()
    );
    downloader.open_gate();

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(handles))
        .await
        .expect("Test timed out");

    let outcomes: Vec<_> = results.into_iter().map(|r| r.expect("task panicked")).collect();
    let longest = outcomes
        .iter()
        .map(|(_, seen)| seen.clone())
        .max_by_key(|seen| seen.len())
        .unwrap();

    let expected_path = outcomes[0].0.clone().unwrap();
    for (result, seen) in &outcomes {
        assert_eq!(result.as_ref().unwrap(), &expected_path);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(is_suffix(seen, &longest), "{seen:?} is not a suffix of {longest:?}");
    }

    assert_eq!(downloader.call_count(), 1);
    let stats = cache.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.downloads, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(coordinator.in_flight(), 0);
}

// =============================================================================
// MANY KEYS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_download_independently() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new(64).chunks(4).chunk_delay(Duration::from_millis(1)));
    let cache = manager(&dir, &downloader);

    const KEYS: usize = 20;
    const PER_KEY: usize = 5;

    let mut handles = Vec::new();
    for k in 0..KEYS {
        for _ in 0..PER_KEY {
            let entry = cache.get(&format!("https://cdn.example.com/img/{k}.webp"), DownloadOptions::new());
            handles.push(tokio::spawn(async move { entry.get_path(|_| {}).await }));
        }
    }

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(handles))
        .await
        .expect("Test timed out");
    for result in results {
        assert!(result.expect("task panicked").is_ok());
    }

    // Late arrivals find the file on disk, so each key is fetched exactly once.
    assert_eq!(downloader.call_count(), KEYS);
    assert_eq!(cache.entries().await.unwrap().len(), KEYS);
    assert_eq!(cache.size().await.unwrap(), (KEYS * 64) as u64);
    assert!(partial_files(&dir).is_empty());
}

// =============================================================================
// REQUESTS RACING WITH COMPLETION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_racing_completion_never_double_download() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new(256).chunks(8).chunk_delay(Duration::from_millis(2)));
    let cache = manager(&dir, &downloader);
    let uri = "https://cdn.example.com/avatar.png";

    // Staggered so some requests join mid-flight and others arrive after the
    // rename.
    let mut handles = Vec::new();
    for i in 0..CONCURRENCY_LEVEL {
        let entry = cache.get(uri, DownloadOptions::new());
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros((i as u64 % 10) * 500)).await;
            entry.get_path(|_| {}).await
        }));
    }

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(handles))
        .await
        .expect("Test timed out");
    let paths: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("task panicked").expect("request failed"))
        .collect();

    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(downloader.call_count(), 1);
    assert_eq!(std::fs::metadata(&paths[0]).unwrap().len(), 256);
}

// =============================================================================
// WAITERS DETACHING MID-TRANSFER
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_some_waiters_detach_transfer_survives() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new(100).gated());
    let cache = manager(&dir, &downloader);
    let uri = "https://cdn.example.com/banner.gif";

    let mut keep = Vec::new();
    let mut abandon = Vec::new();
    for i in 0..20 {
        let entry = cache.get(uri, DownloadOptions::new());
        let task = tokio::spawn(async move { entry.get_path(|_| {}).await });
        if i % 2 == 0 {
            keep.push(task);
        } else {
            abandon.push(task);
        }
        if i == 0 {
            downloader.wait_started().await;
        }
    }

    let coordinator = cache.coordinator().clone();
    assert!(eventually(|| coordinator.stats().joined == 19).await);
    for task in &abandon {
        task.abort();
    }
    downloader.open_gate();

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(keep))
        .await
        .expect("Test timed out");
    for result in results {
        assert!(result.expect("task panicked").is_ok());
    }
    assert_eq!(downloader.call_count(), 1);
    assert_eq!(coordinator.stats().failed, 0);
}
