//! JSON document vault.
//!
//! The document is `{ "<scope>": { "<kid hex>": "<key hex>" } }`. Every insert
//! rewrites the whole document into a temporary file next to the target, syncs
//! it and renames it over the original, so a crash never leaves a torn file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::key::{ContentKey, KeyId};
use crate::vault::{PutOutcome, Vault, compare_existing};

type Document = BTreeMap<String, BTreeMap<String, String>>;

pub struct FileVault {
    name: String,
    path: PathBuf,
    read_only: bool,
    document: RwLock<Document>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileVault {
    /// Opens the vault at `path`, starting empty if the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match tokio::fs::read(&path).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Document::new(),
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::new(),
            Err(e) => return Err(e.into()),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        debug!(
            vault = %name,
            scopes = document.len(),
            "Opened file vault"
        );

        Ok(Self {
            name,
            path,
            read_only: false,
            document: RwLock::new(document),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, scope: &str, kid: &KeyId) -> Result<Option<Vec<u8>>> {
        let document = self.document.read();
        let Some(hex_key) = document.get(scope).and_then(|keys| keys.get(&kid.to_hex())) else {
            return Ok(None);
        };
        hex::decode(hex_key)
            .map(Some)
            .map_err(|e| VaultError::storage(format!("corrupt entry for {kid} in {}: {e}", self.name)))
    }
}

fn write_document(path: &Path, document: &Document) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, document)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| VaultError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl Vault for FileVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }

    async fn get(&self, scope: &str, kid: &KeyId) -> Result<Option<ContentKey>> {
        Ok(self
            .lookup(scope, kid)?
            .map(|key| ContentKey::new(*kid, key)))
    }

    async fn put(&self, scope: &str, key: &ContentKey) -> Result<PutOutcome> {
        if self.read_only {
            return Err(VaultError::ReadOnly {
                vault: self.name.clone(),
            });
        }

        // Serializes writers; readers keep using the published document.
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.lookup(scope, key.kid())? {
            return compare_existing(&self.name, &existing, key);
        }

        let mut next = self.document.read().clone();
        next.entry(scope.to_string())
            .or_default()
            .insert(key.kid().to_hex(), key.key_hex());

        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || write_document(&path, &next).map(|_| next))
            .await
            .map_err(|e| VaultError::storage(format!("vault writer task failed: {e}")))??;

        *self.document.write() = next;
        debug!(vault = %self.name, kid = %key.kid(), scope, "Stored content key");
        Ok(PutOutcome::Inserted)
    }

    async fn list(&self, scope: &str) -> Result<Vec<ContentKey>> {
        let document = self.document.read();
        let Some(keys) = document.get(scope) else {
            return Ok(Vec::new());
        };
        keys.iter()
            .map(|(kid, key)| ContentKey::from_hex(kid, key))
            .collect()
    }
}
