use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::key::{ContentKey, KeyId};
use crate::vault::{PutOutcome, Vault, compare_existing};

/// A key found by [`Vaults::get_key`], with the name of the vault that had it.
#[derive(Debug, Clone)]
pub struct FoundKey {
    pub key: ContentKey,
    pub vault: String,
}

/// An ordered collection of vaults searched front to back.
#[derive(Default, Clone)]
pub struct Vaults {
    vaults: Vec<Arc<dyn Vault>>,
}

impl fmt::Debug for Vaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.vaults.iter().map(|v| v.name()))
            .finish()
    }
}

impl Vaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vaults.push(vault);
        self
    }

    pub fn push(&mut self, vault: Arc<dyn Vault>) {
        self.vaults.push(vault);
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Vault>> {
        self.vaults.iter()
    }

    /// Returns the first non-zero key for `kid`, copying it into every other
    /// writable vault that did not have it yet.
    pub async fn get_key(&self, scope: &str, kid: &KeyId) -> Result<Option<FoundKey>> {
        for (index, vault) in self.vaults.iter().enumerate() {
            let key = match vault.get(scope, kid).await {
                Ok(Some(key)) if !key.is_zero() => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!(vault = vault.name(), %kid, error = %e, "Vault lookup failed");
                    continue;
                }
            };

            for (other_index, other) in self.vaults.iter().enumerate() {
                if other_index == index || !other.is_writable() {
                    continue;
                }
                match other.put(scope, &key).await {
                    Ok(PutOutcome::Inserted) => {
                        debug!(from = vault.name(), to = other.name(), %kid, "Back-filled content key")
                    }
                    Ok(PutOutcome::Unchanged) => {}
                    Err(e) => warn!(vault = other.name(), %kid, error = %e, "Back-fill failed"),
                }
            }

            return Ok(Some(FoundKey {
                key,
                vault: vault.name().to_string(),
            }));
        }
        Ok(None)
    }

    /// Writes `key` through to every writable vault.
    ///
    /// Returns how many vaults newly stored it. Zero keys are skipped. Every
    /// writable vault is checked before any write, so a conflict in one of
    /// them leaves all of them untouched.
    pub async fn add_key(&self, scope: &str, key: &ContentKey) -> Result<usize> {
        if key.is_zero() {
            debug!(kid = %key.kid(), "Skipping zero content key");
            return Ok(0);
        }

        let writable: Vec<&Arc<dyn Vault>> =
            self.vaults.iter().filter(|v| v.is_writable()).collect();
        for vault in &writable {
            if let Some(existing) = vault.get(scope, key.kid()).await? {
                compare_existing(vault.name(), existing.key(), key)?;
            }
        }

        let mut inserted = 0;
        for vault in writable {
            match vault.put(scope, key).await {
                Ok(PutOutcome::Inserted) => inserted += 1,
                Ok(PutOutcome::Unchanged) => {}
                Err(VaultError::ReadOnly { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    pub async fn add_keys(&self, scope: &str, keys: &[ContentKey]) -> Result<usize> {
        let mut inserted = 0;
        for key in keys {
            inserted += self.add_key(scope, key).await?;
        }
        Ok(inserted)
    }
}
