//! In-memory secret storage with secure memory handling.
//!
//! Values live only in RAM and are zeroized when replaced or when the
//! store is dropped. Never persisted to disk.

use crate::secrets::{SecretGetter, SecretSetter};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

struct StoredSecret {
    secret_type: String,
    value: Zeroizing<Vec<u8>>,
}

/// Secret store backed by a map in process memory.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, StoredSecret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classification recorded with the last write, if any.
    pub async fn secret_type(&self, secret_ref: &str) -> Option<String> {
        self.secrets
            .read()
            .await
            .get(secret_ref)
            .map(|s| s.secret_type.clone())
    }

    pub async fn contains(&self, secret_ref: &str) -> bool {
        self.secrets.read().await.contains_key(secret_ref)
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SecretSetter for MemorySecretStore {
    async fn set(&self, secret_ref: &str, secret_type: &str, value: &[u8]) -> anyhow::Result<()> {
        let stored = StoredSecret {
            secret_type: secret_type.to_string(),
            value: Zeroizing::new(value.to_vec()),
        };
        // The replaced entry is zeroized as it drops.
        self.secrets
            .write()
            .await
            .insert(secret_ref.to_string(), stored);
        Ok(())
    }
}

#[async_trait]
impl SecretGetter for MemorySecretStore {
    async fn get(&self, secret_ref: &str) -> anyhow::Result<Vec<u8>> {
        self.secrets
            .read()
            .await
            .get(secret_ref)
            .map(|s| s.value.to_vec())
            .ok_or_else(|| anyhow::anyhow!("secret {secret_ref:?} not found"))
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("secrets", &"<redacted>")
            .finish_non_exhaustive()
    }
}
