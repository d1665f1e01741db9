use async_trait::async_trait;

use crate::error::{Result, VaultError};
use crate::key::{ContentKey, KeyId};

/// Outcome of a successful [`Vault::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not known and has been durably stored.
    Inserted,
    /// An identical key was already stored; nothing was written.
    Unchanged,
}

/// A persistent content key store.
///
/// Implementations must make `put` atomic from the point of view of concurrent
/// `get` callers, and durable before it returns.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Human readable name used in logs and key source reports.
    fn name(&self) -> &str;

    fn is_writable(&self) -> bool {
        true
    }

    async fn get(&self, scope: &str, kid: &KeyId) -> Result<Option<ContentKey>>;

    /// Conflict-checked insert.
    async fn put(&self, scope: &str, key: &ContentKey) -> Result<PutOutcome>;

    async fn list(&self, scope: &str) -> Result<Vec<ContentKey>>;
}

/// Compares a candidate against the stored entry for the same key id.
pub(crate) fn compare_existing(
    vault: &str,
    existing: &[u8],
    candidate: &ContentKey,
) -> Result<PutOutcome> {
    if existing == candidate.key() {
        Ok(PutOutcome::Unchanged)
    } else {
        Err(VaultError::KeyConflict {
            kid: *candidate.kid(),
            vault: vault.to_string(),
        })
    }
}
