// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Downloader capability.
//!
//! The cache never talks to the network itself. It hands a [`Downloader`]
//! a URL and a partial-file path, receives chunk reports while bytes
//! arrive, and moves the finished file into place.
//!
//! ```text
//! ┌─────────────────────┐  download(url, dest, on_chunk)  ┌────────────┐
//! │ DownloadCoordinator │────────────────────────────────▶│ Downloader │
//! │   (one task per     │◀──── on_chunk(written, total) ───│ (reqwest)  │
//! │    transfer)        │◀──────────── Ok(dest) ───────────│            │
//! └─────────────────────┘                                  └────────────┘
//! ```

pub mod http;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use url::Url;

use crate::error::CacheResult;
use crate::options::DownloadOptions;

pub use http::HttpDownloader;

/// Chunk report: `(bytes_written_so_far, bytes_expected)`.
pub type ChunkCallback = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Transport that fetches one resource into a local file.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Write the body of `url` to `dest`, calling `on_chunk` as bytes land.
    ///
    /// Returns the path written, normally `dest`. Transport failures are
    /// `CacheError::Network`; local write failures are `CacheError::Write`.
    /// The caller removes `dest` on failure.
    async fn download(
        &self,
        url: &Url,
        options: &DownloadOptions,
        dest: &Path,
        on_chunk: &ChunkCallback,
    ) -> CacheResult<PathBuf>;
}
