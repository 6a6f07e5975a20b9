// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! URI-to-local-file cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  get(uri)   ┌────────────┐
//! │ CacheManager │────────────▶│ KeyDeriver │  sha256(uri [+ headers])
//! └──────┬───────┘             └────────────┘
//!        │ CacheEntry::get_path
//!        ▼
//! ┌──────────────┐  hit        ┌──────────────────────┐
//! │ StorageProbe │────────────▶│ Ok(<root>/<key>)     │
//! └──────┬───────┘             └──────────────────────┘
//!        │ miss
//!        ▼
//! ┌─────────────────────┐      ┌────────────┐
//! │ DownloadCoordinator │─────▶│ Downloader │  one per key at a time
//! │  key -> Transfer    │      └────────────┘
//! └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use uricache::{CacheConfig, CacheManager, DownloadOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = CacheManager::new(&CacheConfig::load()?)?;
//! let entry = manager.get("https://example.com/photo.jpg", DownloadOptions::default());
//! let path = entry
//!     .get_path(|p| {
//!         if let Some(f) = p.fraction() {
//!             println!("{:.0}%", f * 100.0);
//!         }
//!     })
//!     .await?;
//! println!("cached at {}", path.display());
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod key;
pub mod manager;
pub mod storage;
pub mod transfer;

pub use coordinator::{CoordinatorStats, DownloadCoordinator};
pub use key::{CacheKey, KeyDeriver, KeyPolicy};
pub use manager::{CacheEntry, CacheManager, EntryState};
pub use storage::{FileInfo, FileSystem, LocalFileSystem, StorageProbe, StoredEntry};
pub use transfer::{Progress, Transfer, TransferEvent, TransferEvents, TransferHandle, TransferState};
