use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::key::{ContentKey, KeyId};
use crate::vault::{PutOutcome, Vault, compare_existing};

/// Process-local vault. Nothing survives a restart.
#[derive(Debug)]
pub struct MemoryVault {
    name: String,
    entries: RwLock<HashMap<(String, KeyId), Vec<u8>>>,
}

impl MemoryVault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl Vault for MemoryVault {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, scope: &str, kid: &KeyId) -> Result<Option<ContentKey>> {
        let entries = self.entries.read();
        Ok(entries
            .get(&(scope.to_string(), *kid))
            .map(|key| ContentKey::new(*kid, key.clone())))
    }

    async fn put(&self, scope: &str, key: &ContentKey) -> Result<PutOutcome> {
        let mut entries = self.entries.write();
        let slot = (scope.to_string(), *key.kid());
        if let Some(existing) = entries.get(&slot) {
            return compare_existing(&self.name, existing, key);
        }
        entries.insert(slot, key.key().to_vec());
        Ok(PutOutcome::Inserted)
    }

    async fn list(&self, scope: &str) -> Result<Vec<ContentKey>> {
        let entries = self.entries.read();
        let mut keys: Vec<ContentKey> = entries
            .iter()
            .filter(|((s, _), _)| s == scope)
            .map(|((_, kid), key)| ContentKey::new(*kid, key.clone()))
            .collect();
        keys.sort_by(|a, b| a.kid().cmp(b.kid()));
        Ok(keys)
    }
}
