// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-request download options.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Caller-supplied configuration for one request.
///
/// Headers take part in key derivation only under
/// [`KeyPolicy::UriAndHeaders`](crate::cache::KeyPolicy). `timeout` and
/// `refresh` never affect the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Request headers, keyed by lowercased name.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Maximum transfer duration. Falls back to the cache's default.
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    /// Skip the local copy and fetch again, replacing it on success.
    #[serde(default)]
    pub refresh: bool,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request header. Names are case-insensitive and stored lowercased.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().trim().to_ascii_lowercase(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Parse a `name:value` header argument.
    pub fn parse_header(raw: &str) -> Option<(String, String)> {
        let (name, value) = raw.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_ascii_lowercase(), value.trim().to_string()))
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
