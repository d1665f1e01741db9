use crate::key::KeyId;

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("key conflict for {kid} in vault `{vault}`: a different content key is already stored")]
    KeyConflict { kid: KeyId, vault: String },

    #[error("vault `{vault}` is read-only")]
    ReadOnly { vault: String },

    #[error("invalid key id `{input}`: {reason}")]
    InvalidKeyId { input: String, reason: String },

    #[error("invalid content key: {reason}")]
    InvalidKey { reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vault storage error: {reason}")]
    Storage { reason: String },
}

impl VaultError {
    pub fn invalid_key_id(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyId {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KeyConflict { .. })
    }
}
