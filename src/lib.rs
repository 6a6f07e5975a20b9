// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! uricache - content-keyed local cache for remote resources
//!
//! Resolve a URI to a local file, downloading it at most once no matter
//! how many callers ask for it at the same time.
//!
//! # Core Modules
//!
//! - [`cache`] - Key derivation, storage probe, single-flight coordinator, facade
//! - [`download`] - Downloader capability and the reqwest-backed implementation
//! - [`options`] - Per-request download options
//! - [`config`] - Cache configuration (file, environment)
//! - [`error`] - Error taxonomy and CLI error formatting
//! - [`sync`] - Poison-tolerant lock helpers

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod options;
pub mod sync;

pub use cache::{
    CacheEntry, CacheKey, CacheManager, DownloadCoordinator, EntryState, FileSystem, KeyDeriver,
    KeyPolicy, LocalFileSystem, Progress, StorageProbe, StoredEntry, TransferEvent, TransferHandle,
    TransferState,
};
pub use config::CacheConfig;
pub use download::{Downloader, HttpDownloader};
pub use error::{CacheError, CacheResult, NetworkError};
pub use options::DownloadOptions;
