//! Resolved-key export: `{ "<track id>": { "<kid hex>": "<key hex>" } }`.

use std::collections::BTreeMap;
use std::path::Path;

use keyvault::ContentKey;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyExport {
    tracks: BTreeMap<String, BTreeMap<String, String>>,
}

impl KeyExport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an existing export, or an empty one if `path` does not exist.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(std::io::Error::other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn add<'a>(&mut self, track_id: &str, keys: impl IntoIterator<Item = &'a ContentKey>) {
        let entry = self.tracks.entry(track_id.to_string()).or_default();
        for key in keys {
            entry.insert(key.kid().to_hex(), key.key_hex());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.values().all(BTreeMap::is_empty)
    }

    pub fn key_count(&self) -> usize {
        self.tracks.values().map(BTreeMap::len).sum()
    }

    pub fn to_json(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()).await?;
        info!(path = %path.display(), keys = self.key_count(), "Exported content keys");
        Ok(())
    }
}
