// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming HTTP downloader backed by reqwest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{ChunkCallback, Downloader};
use crate::error::{CacheError, CacheResult, NetworkError};
use crate::options::DownloadOptions;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Downloader`] issuing one streaming GET per transfer.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpDownloader {
    pub fn new() -> CacheResult<Self> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("uricache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_connect() {
            NetworkError::Connect(err.to_string()).into()
        } else if err.is_timeout() {
            NetworkError::Timeout {
                after: self.connect_timeout,
            }
            .into()
        } else {
            NetworkError::Transport(err.to_string()).into()
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &Url,
        options: &DownloadOptions,
        dest: &Path,
        on_chunk: &ChunkCallback,
    ) -> CacheResult<PathBuf> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetworkError::Transport(format!("unsupported scheme {:?}", url.scheme())).into());
        }

        let mut request = self.client.get(url.clone());
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status.as_u16()).into());
        }

        let expected = response.content_length();
        if let Some(len) = expected {
            check_free_space(dest, len)?;
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CacheError::write(format!("create {}", dest.display()), e))?;

        on_chunk(0, expected);

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.map_error(e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CacheError::write(format!("write {}", dest.display()), e))?;
            written += chunk.len() as u64;
            on_chunk(written, expected);
        }

        // Flush to disk before the caller renames the file into place.
        file.flush()
            .await
            .map_err(|e| CacheError::write(format!("flush {}", dest.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| CacheError::write(format!("sync {}", dest.display()), e))?;

        if let Some(len) = expected {
            if written < len {
                return Err(NetworkError::Transport(format!(
                    "body ended after {} of {} bytes",
                    written, len
                ))
                .into());
            }
        }

        tracing::debug!(url = %url, bytes = written, "body received");
        Ok(dest.to_path_buf())
    }
}

/// Fail early when the volume holding `dest` cannot fit `needed` bytes.
fn check_free_space(dest: &Path, needed: u64) -> CacheResult<()> {
    let Some(dir) = dest.parent() else {
        return Ok(());
    };
    match fs2::available_space(dir) {
        Ok(available) if available < needed => Err(CacheError::Write(format!(
            "insufficient disk space: need {} bytes, {} available",
            needed, available
        ))),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "could not query free space");
            Ok(())
        }
    }
}
