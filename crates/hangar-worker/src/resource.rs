// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource scripts and the values they exchange.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::container::{Container, ScriptRequest};
use crate::error::{Error, Result};

/// Script fetching a version into a directory.
pub const GET_SCRIPT: &str = "/opt/resource/in";

/// A resource version, e.g. `{"ref": "abc123"}`.
pub type Version = BTreeMap<String, String>;

/// One entry of version metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

impl MetadataField {
    /// Builds a field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// What a `get` script prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    /// Fetched version.
    pub version: Version,
    /// Metadata describing it.
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Outcome of fetching a resource version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    /// Exit status of the `get` script. Non-zero means no volume was
    /// produced.
    pub exit_status: i32,
    /// Version and metadata reported by the script.
    pub version_result: VersionResult,
    /// Handle of the volume holding the fetched bits.
    pub artifact_handle: Option<String>,
}

/// A resource as seen by the `get` script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource configuration.
    pub source: Value,
    /// Step parameters.
    #[serde(default)]
    pub params: Value,
    /// Version to fetch.
    pub version: Version,
}

impl Resource {
    /// Runs the `get` script in `container`, fetching into `dir`.
    ///
    /// The script is recoverable, so a restarted scheduler picks up the
    /// result of a run already in progress.
    pub async fn get(&self, cancel: &CancellationToken, container: &Container, dir: &str) -> Result<VersionResult> {
        let request = ScriptRequest {
            path: GET_SCRIPT.to_string(),
            args: vec![dir.to_string()],
            stdin: serde_json::to_vec(self)?,
        };
        let stdout = container.run_script(cancel, &request, true).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            Error::Json(e).context(format!("parse output of {GET_SCRIPT}"))
        })
    }
}

/// One version of one resource configuration, fetchable onto any worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCache {
    /// Database ID of the cache.
    pub id: i64,
    /// Base or custom resource type.
    pub resource_type: String,
    /// The resource to fetch.
    pub resource: Resource,
}

impl ResourceCache {
    /// Lock name for fetching this cache onto `worker`.
    ///
    /// Every field is length-prefixed, so no two distinct caches share a
    /// name.
    pub fn lock_name(&self, worker: &str) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, self.resource_type.as_bytes());
        hash_field(&mut hasher, self.resource.source.to_string().as_bytes());
        hash_field(&mut hasher, self.resource.params.to_string().as_bytes());
        hasher.update((self.resource.version.len() as u64).to_be_bytes());
        for (k, v) in &self.resource.version {
            hash_field(&mut hasher, k.as_bytes());
            hash_field(&mut hasher, v.as_bytes());
        }
        hash_field(&mut hasher, worker.as_bytes());
        hex(&hasher.finalize())
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> ResourceCache {
        ResourceCache {
            id: 1,
            resource_type: "git".into(),
            resource: Resource {
                source: json!({"uri": "https://example.com/repo.git"}),
                params: json!({}),
                version: Version::from([("ref".to_string(), "abc".to_string())]),
            },
        }
    }

    #[test]
    fn test_lock_name_is_per_worker() {
        let cache = cache();
        assert_eq!(cache.lock_name("w1"), cache.lock_name("w1"));
        assert_ne!(cache.lock_name("w1"), cache.lock_name("w2"));
        assert_eq!(cache.lock_name("w1").len(), 64);
    }

    #[test]
    fn test_lock_name_keeps_field_boundaries() {
        let mut ab = cache();
        ab.resource.version = Version::from([("ab".to_string(), "c".to_string())]);
        let mut a = cache();
        a.resource.version = Version::from([("a".to_string(), "bc".to_string())]);
        assert_ne!(ab.lock_name("w1"), a.lock_name("w1"));
    }

    #[test]
    fn test_version_result_metadata_is_optional() {
        let parsed: VersionResult = serde_json::from_str(r#"{"version":{"ref":"abc"}}"#).unwrap();
        assert_eq!(parsed.version.get("ref").map(String::as_str), Some("abc"));
        assert!(parsed.metadata.is_empty());
    }
}
