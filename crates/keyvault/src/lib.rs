//! # Key Vault
//!
//! Persistent caches of DRM content keys, keyed by `(scope, key_id)`.
//!
//! A vault is append-only: a key id maps to at most one content key per scope
//! for the lifetime of the store. Re-inserting an identical key is a no-op,
//! inserting a different key for a known key id fails with
//! [`VaultError::KeyConflict`] and leaves the stored entry untouched.
//!
//! Backends:
//! - [`MemoryVault`]: process-local, used for tests and as a front cache
//! - [`FileVault`]: a JSON document rewritten atomically on every insert
//! - [`SqliteVault`]: a SQLite table accessed through `sqlx`
//!
//! [`Vaults`] searches several backends in order and writes through to all of
//! the writable ones.

pub mod error;
pub mod file;
pub mod key;
pub mod memory;
pub mod sqlite;
pub mod vault;
pub mod vaults;

pub use error::{Result, VaultError};
pub use file::FileVault;
pub use key::{ContentKey, KeyId};
pub use memory::MemoryVault;
pub use sqlite::SqliteVault;
pub use vault::{PutOutcome, Vault};
pub use vaults::{FoundKey, Vaults};
