// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache key derivation.
//!
//! A key is the hex SHA-256 of the normalized URI (and, depending on
//! [`KeyPolicy`], the request headers). The stored file name is the digest
//! plus the extension of the URI's last path segment, so adversarial URIs
//! can never escape the cache root.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::options::DownloadOptions;

/// Longest extension carried over from the URI.
const MAX_EXTENSION_LEN: usize = 8;

/// Which request inputs identify a cached resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Only the URI. Requests differing in headers share one entry.
    #[default]
    UriOnly,
    /// URI plus every request header.
    UriAndHeaders,
}

/// Stable identifier of a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    digest: String,
    extension: Option<String>,
}

impl CacheKey {
    /// Hex SHA-256 digest of the key material.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// File name of the entry inside the cache root.
    pub fn file_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.digest, ext),
            None => self.digest.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Maps `(uri, options)` to a [`CacheKey`] and its path under the root.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    root: PathBuf,
    policy: KeyPolicy,
}

impl KeyDeriver {
    pub fn new(root: impl Into<PathBuf>, policy: KeyPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Derive the key and local path for a request. Pure; performs no I/O.
    pub fn derive_key(&self, uri: &str, options: &DownloadOptions) -> CacheResult<(CacheKey, PathBuf)> {
        let url = parse_uri(uri)?;

        let mut hasher = Sha256::new();
        update_field(&mut hasher, url.as_str());
        if self.policy == KeyPolicy::UriAndHeaders {
            // BTreeMap iteration is sorted, so header order never matters.
            for (name, value) in &options.headers {
                update_field(&mut hasher, name);
                update_field(&mut hasher, value);
            }
        }

        let key = CacheKey {
            digest: hex::encode(hasher.finalize()),
            extension: extension_of(&url),
        };
        let path = self.root.join(key.file_name());
        Ok((key, path))
    }
}

/// Validate and normalize a URI. The fragment is dropped; it never reaches
/// the server.
pub fn parse_uri(uri: &str) -> CacheResult<Url> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(CacheError::invalid_uri(uri, "empty URI"));
    }
    let mut url = Url::parse(trimmed).map_err(|e| CacheError::invalid_uri(uri, e))?;
    if url.cannot_be_a_base() {
        return Err(CacheError::invalid_uri(uri, "not a hierarchical resource locator"));
    }
    url.set_fragment(None);
    Ok(url)
}

// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn update_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

fn extension_of(url: &Url) -> Option<String> {
    let last = url.path_segments()?.last()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
