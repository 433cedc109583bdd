//! Secret store seam.
//!
//! The token service never holds secrets itself. It writes the value a
//! human typed through [`SecretSetter`] and reads the value an agent is
//! owed through [`SecretGetter`]. Two backends ship with the crate:
//!
//! - [`MemorySecretStore`]: process memory, zeroized on overwrite and drop
//! - [`SealedSecretStore`]: ChaCha20-Poly1305 sealed rows in SQLite
//!
//! `set` must be an idempotent overwrite: two racing form submissions for
//! the same link may both reach it, and the last write wins.

pub mod memory;
pub mod sealed;

use async_trait::async_trait;

pub use memory::MemorySecretStore;
pub use sealed::{CryptoError, SealedSecretStore};

/// Write side of the external secret store.
#[async_trait]
pub trait SecretSetter: Send + Sync {
    async fn set(&self, secret_ref: &str, secret_type: &str, value: &[u8]) -> anyhow::Result<()>;
}

/// Read side of the external secret store.
#[async_trait]
pub trait SecretGetter: Send + Sync {
    /// Returns the plaintext. Unknown refs are an error.
    async fn get(&self, secret_ref: &str) -> anyhow::Result<Vec<u8>>;
}
