//! Provider manifests
//!
//! A manifest lists declared providers as JSON, for tooling and for
//! registries that only need to answer resolution queries:
//!
//! ```json
//! {
//!   "name": "color-modules",
//!   "providers": [
//!     {
//!       "kind": "context_builder",
//!       "id": "org.cmm.lcm2",
//!       "registration": "org/oyranos/openicc/icc._lcm2",
//!       "rank_table": [{"key": "manufacturer", "expected": "EPSON", "match_value": 10}]
//!     }
//!   ]
//! }
//! ```
//!
//! Entries are decoded one by one, so a malformed entry is reported without
//! losing the rest of the manifest.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CMMError, Result};

use super::provider::{CapabilityKind, Provider, ProviderDescriptor};
use super::ProviderSource;

/// One declared provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: CapabilityKind,
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
}

/// A parsed manifest; entries stay raw until enumerated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderManifest {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub providers: Vec<Value>,
}

fn default_name() -> String {
    "manifest".to_string()
}

impl ProviderManifest {
    /// Parse manifest JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CMMError::InvalidManifest {
            reason: e.to_string(),
        })
    }

    /// Load a manifest file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CMMError::ManifestLoadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut manifest = Self::from_json(&content)?;
        if manifest.name == default_name() {
            manifest.name = path.display().to_string();
        }
        Ok(manifest)
    }

    /// Decode every entry
    pub fn entries(&self) -> Vec<Result<ManifestEntry>> {
        self.providers
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                ManifestEntry::deserialize(raw).map_err(|e| CMMError::InvalidManifest {
                    reason: format!("entry {}: {}", index, e),
                })
            })
            .collect()
    }
}

impl ProviderSource for ProviderManifest {
    fn name(&self) -> &str {
        &self.name
    }

    fn providers(&self) -> Vec<Result<Provider>> {
        self.entries()
            .into_iter()
            .map(|entry| entry.map(|e| Provider::declared(e.descriptor, e.kind)))
            .collect()
    }
}
