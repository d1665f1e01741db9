//! AES-128 segment ciphers with incremental input.
//!
//! CBC holds back the final block until [`SegmentDecryptor::finalize`] so the
//! PKCS#7 padding can be stripped; CTR has no padding and streams through.

use aes::Aes128;
use bytes::Bytes;
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};

use crate::track::CipherScheme;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("content key must be {KEY_SIZE} bytes, got {len}")]
    InvalidKeyLength { len: usize },

    #[error("ciphertext is not block aligned ({len} trailing bytes)")]
    NotBlockAligned { len: usize },

    #[error("ciphertext is empty")]
    Empty,

    #[error("invalid PKCS#7 padding")]
    BadPadding,
}

/// IV for segment `index`.
///
/// CBC adds the index to the base IV as a 128-bit big-endian integer, which
/// for a zero base is the HLS media-sequence IV. CTR puts `base_high + index`
/// in the upper 64 bits and starts the block counter at zero, so segments
/// never share keystream.
pub fn derive_iv(scheme: CipherScheme, base: Option<[u8; 16]>, index: u64) -> [u8; 16] {
    let base = u128::from_be_bytes(base.unwrap_or([0; 16]));
    match scheme {
        CipherScheme::Cbc => base.wrapping_add(u128::from(index)).to_be_bytes(),
        CipherScheme::Ctr => {
            let nonce = ((base >> 64) as u64).wrapping_add(index);
            (u128::from(nonce) << 64).to_be_bytes()
        }
    }
}

/// Decrypts one segment fed in arbitrary-sized pieces.
pub enum SegmentDecryptor {
    Cbc {
        cipher: Aes128CbcDec,
        pending: Vec<u8>,
    },
    Ctr {
        cipher: Aes128Ctr,
    },
}

impl SegmentDecryptor {
    pub fn new(scheme: CipherScheme, key: &[u8], iv: &[u8; 16]) -> Result<Self, DecryptError> {
        if key.len() != KEY_SIZE {
            return Err(DecryptError::InvalidKeyLength { len: key.len() });
        }
        let invalid = |_| DecryptError::InvalidKeyLength { len: key.len() };
        Ok(match scheme {
            CipherScheme::Cbc => Self::Cbc {
                cipher: Aes128CbcDec::new_from_slices(key, iv).map_err(invalid)?,
                pending: Vec::with_capacity(2 * BLOCK_SIZE),
            },
            CipherScheme::Ctr => Self::Ctr {
                cipher: Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?,
            },
        })
    }

    /// Returns whatever plaintext `input` completes.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Ctr { cipher } => {
                let mut out = input.to_vec();
                cipher.apply_keystream(&mut out);
                out
            }
            Self::Cbc { cipher, pending } => {
                pending.extend_from_slice(input);
                let trailing = pending.len() % BLOCK_SIZE;
                let hold = if trailing == 0 {
                    BLOCK_SIZE.min(pending.len())
                } else {
                    trailing
                };
                let ready = pending.len() - hold;

                let mut out: Vec<u8> = pending.drain(..ready).collect();
                for block in out.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                out
            }
        }
    }

    /// Flushes the held-back block, removing padding.
    pub fn finalize(self) -> Result<Vec<u8>, DecryptError> {
        match self {
            Self::Ctr { .. } => Ok(Vec::new()),
            Self::Cbc { cipher, mut pending } => {
                if pending.is_empty() {
                    return Err(DecryptError::Empty);
                }
                if pending.len() != BLOCK_SIZE {
                    return Err(DecryptError::NotBlockAligned {
                        len: pending.len() % BLOCK_SIZE,
                    });
                }
                cipher
                    .decrypt_padded_mut::<Pkcs7>(&mut pending)
                    .map(<[u8]>::to_vec)
                    .map_err(|_| DecryptError::BadPadding)
            }
        }
    }

    /// Feeds `data` through in `chunk_size` pieces and returns the non-empty
    /// plaintext chunks. The held-back CBC block stays pending until
    /// [`finalize`](Self::finalize).
    pub fn update_chunked(&mut self, data: &[u8], chunk_size: usize) -> Vec<Bytes> {
        data.chunks(chunk_size.max(BLOCK_SIZE))
            .map(|piece| self.update(piece))
            .filter(|plain| !plain.is_empty())
            .map(Bytes::from)
            .collect()
    }
}

/// Encrypts a whole segment. Used to produce fixtures and to re-protect
/// content.
pub fn encrypt_segment(
    scheme: CipherScheme,
    key: &[u8],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    if key.len() != KEY_SIZE {
        return Err(DecryptError::InvalidKeyLength { len: key.len() });
    }
    let invalid = |_| DecryptError::InvalidKeyLength { len: key.len() };
    match scheme {
        CipherScheme::Cbc => {
            let cipher = Aes128CbcEnc::new_from_slices(key, iv).map_err(invalid)?;
            let padded_len = (plaintext.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let mut buffer = vec![0u8; padded_len];
            buffer[..plaintext.len()].copy_from_slice(plaintext);
            let encrypted = cipher
                .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
                .map_err(|_| DecryptError::BadPadding)?;
            Ok(encrypted.to_vec())
        }
        CipherScheme::Ctr => {
            let mut cipher = Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?;
            let mut buffer = plaintext.to_vec();
            cipher.apply_keystream(&mut buffer);
            Ok(buffer)
        }
    }
}
