//! Segment decryption for one track.

pub mod cipher;

use std::collections::HashMap;

use bytes::Bytes;
use keyvault::{KeyId, Vaults};
use tracing::{debug, trace};

use crate::config::DecryptionConfig;
use crate::error::PipelineError;
use crate::track::{ProtectionDescriptor, Segment};

pub use self::cipher::{DecryptError, SegmentDecryptor, derive_iv, encrypt_segment};

/// Turns downloaded segment bodies into plaintext, looking keys up in the
/// vaults by the segment's key id.
pub struct TrackDecryptor {
    protection: Option<ProtectionDescriptor>,
    vaults: Vaults,
    keys: HashMap<KeyId, Vec<u8>>,
    chunk_size: usize,
    offload: bool,
}

impl TrackDecryptor {
    pub fn new(
        protection: Option<ProtectionDescriptor>,
        vaults: Vaults,
        config: &DecryptionConfig,
    ) -> Self {
        Self {
            protection,
            vaults,
            keys: HashMap::new(),
            chunk_size: config.chunk_size,
            offload: config.offload_to_blocking_pool,
        }
    }

    async fn key_for(&mut self, protection: &ProtectionDescriptor, kid: KeyId) -> Result<Vec<u8>, PipelineError> {
        if let Some(key) = self.keys.get(&kid) {
            return Ok(key.clone());
        }
        let found = self
            .vaults
            .get_key(protection.system().as_str(), &kid)
            .await?
            .ok_or(PipelineError::MissingKey { kid })?;
        debug!(%kid, vault = %found.vault, "Loaded content key for decryption");
        let key = found.key.key().to_vec();
        self.keys.insert(kid, key.clone());
        Ok(key)
    }

    /// Starts decrypting `segment`. Clear tracks get a pass-through stream.
    pub async fn open_segment(&mut self, segment: &Segment) -> Result<SegmentStream, PipelineError> {
        let index = segment.index;
        let Some(protection) = self.protection.clone() else {
            return Ok(SegmentStream {
                index,
                protected: false,
                cipher: None,
                chunk_size: self.chunk_size,
                offload: self.offload,
            });
        };

        let kid = match segment.key_id.or_else(|| protection.default_key_id().copied()) {
            Some(kid) => kid,
            None => {
                return Err(PipelineError::internal(
                    "protected track has no default key id",
                ));
            }
        };
        let key = self.key_for(&protection, kid).await?;
        let iv = protection.segment_iv(index);
        let cipher = SegmentDecryptor::new(protection.scheme(), &key, &iv).map_err(|e| {
            PipelineError::Decryption {
                index,
                reason: e.to_string(),
            }
        })?;

        trace!(index, offload = self.offload, "Opened segment decryptor");
        Ok(SegmentStream {
            index,
            protected: true,
            cipher: Some(cipher),
            chunk_size: self.chunk_size,
            offload: self.offload,
        })
    }
}

/// Plaintext for one segment, produced as its ciphertext arrives.
pub struct SegmentStream {
    index: u64,
    protected: bool,
    cipher: Option<SegmentDecryptor>,
    chunk_size: usize,
    offload: bool,
}

impl SegmentStream {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Decrypts the next piece of ciphertext. Pieces of at least
    /// `chunk_size` bytes run on the blocking pool when offloading is on.
    pub async fn update(&mut self, data: Bytes) -> Result<Vec<Bytes>, PipelineError> {
        if !self.protected {
            return Ok(vec![data]);
        }
        let mut cipher = self.take_cipher()?;
        let chunk_size = self.chunk_size;

        let (cipher, plain) = if self.offload && data.len() >= chunk_size {
            tokio::task::spawn_blocking(move || {
                let plain = cipher.update_chunked(&data, chunk_size);
                (cipher, plain)
            })
            .await
            .map_err(|e| PipelineError::internal(format!("decryption task failed: {e}")))?
        } else {
            let plain = cipher.update_chunked(&data, chunk_size);
            (cipher, plain)
        };
        self.cipher = Some(cipher);
        Ok(plain)
    }

    /// Flushes the last block and checks padding.
    pub fn finish(mut self) -> Result<Bytes, PipelineError> {
        if !self.protected {
            return Ok(Bytes::new());
        }
        let index = self.index;
        self.take_cipher()?
            .finalize()
            .map(Bytes::from)
            .map_err(|e| PipelineError::Decryption {
                index,
                reason: e.to_string(),
            })
    }

    fn take_cipher(&mut self) -> Result<SegmentDecryptor, PipelineError> {
        self.cipher.take().ok_or_else(|| {
            PipelineError::internal(format!("decryptor for segment {} was lost", self.index))
        })
    }
}
