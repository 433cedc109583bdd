//! Database-backed secret storage.
//!
//! Every value is sealed with ChaCha20-Poly1305 under a master key supplied
//! through configuration, with a fresh random nonce per write and the secret
//! ref as associated data so a ciphertext cannot be moved to another ref.

use crate::db::DbPool;
use crate::secrets::{SecretGetter, SecretSetter};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Master key must be 32 bytes")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid nonce length")]
    InvalidNonce,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Parse a base64 master key into a cipher.
pub fn parse_master_key(base64_key: &str) -> CryptoResult<ChaCha20Poly1305> {
    let bytes = Zeroizing::new(BASE64.decode(base64_key.trim())?);
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey);
    }
    ChaCha20Poly1305::new_from_slice(&bytes).map_err(|_| CryptoError::InvalidKey)
}

/// Seal `plaintext`, returning base64 nonce and ciphertext.
pub fn seal(
    cipher: &ChaCha20Poly1305,
    secret_ref: &str,
    plaintext: &[u8],
) -> CryptoResult<(String, String)> {
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: secret_ref.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((BASE64.encode(nonce_bytes), BASE64.encode(ciphertext)))
}

/// Reverse of [`seal`].
pub fn open(
    cipher: &ChaCha20Poly1305,
    secret_ref: &str,
    nonce_base64: &str,
    ciphertext_base64: &str,
) -> CryptoResult<Vec<u8>> {
    let nonce_bytes = BASE64.decode(nonce_base64)?;
    if nonce_bytes.len() != 12 {
        return Err(CryptoError::InvalidNonce);
    }
    let ciphertext = BASE64.decode(ciphertext_base64)?;

    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: secret_ref.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Secret store persisted in the `secrets` table.
pub struct SealedSecretStore {
    pool: DbPool,
    cipher: ChaCha20Poly1305,
}

impl SealedSecretStore {
    /// Build the store and make sure its table exists.
    pub async fn connect(pool: DbPool, master_key_base64: &str) -> anyhow::Result<Self> {
        let cipher = parse_master_key(master_key_base64)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                secret_ref TEXT PRIMARY KEY NOT NULL,
                secret_type TEXT NOT NULL,
                nonce TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("create secrets table")?;

        info!("Sealed secret store ready");
        Ok(Self { pool, cipher })
    }
}

#[async_trait]
impl SecretSetter for SealedSecretStore {
    async fn set(&self, secret_ref: &str, secret_type: &str, value: &[u8]) -> anyhow::Result<()> {
        let (nonce, ciphertext) = seal(&self.cipher, secret_ref, value)?;

        sqlx::query(
            r#"
            INSERT INTO secrets (secret_ref, secret_type, nonce, ciphertext, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(secret_ref) DO UPDATE SET
                secret_type = excluded.secret_type,
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(secret_ref)
        .bind(secret_type)
        .bind(nonce)
        .bind(ciphertext)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("write sealed secret")?;

        Ok(())
    }
}

#[async_trait]
impl SecretGetter for SealedSecretStore {
    async fn get(&self, secret_ref: &str) -> anyhow::Result<Vec<u8>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT nonce, ciphertext FROM secrets WHERE secret_ref = ?")
                .bind(secret_ref)
                .fetch_optional(&self.pool)
                .await
                .context("read sealed secret")?;

        let (nonce, ciphertext) =
            row.ok_or_else(|| anyhow::anyhow!("secret {secret_ref:?} not found"))?;
        Ok(open(&self.cipher, secret_ref, &nonce, &ciphertext)?)
    }
}

impl std::fmt::Debug for SealedSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSecretStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_test_db;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = parse_master_key(&test_key()).unwrap();
        let (nonce, ciphertext) = seal(&cipher, "openai_key", b"sk-live-abc").unwrap();
        let plaintext = open(&cipher, "openai_key", &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"sk-live-abc");
    }

    #[test]
    fn test_ciphertext_bound_to_ref() {
        let cipher = parse_master_key(&test_key()).unwrap();
        let (nonce, ciphertext) = seal(&cipher, "openai_key", b"sk-live-abc").unwrap();
        assert!(matches!(
            open(&cipher, "other_key", &nonce, &ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_master_key_validation() {
        assert!(matches!(
            parse_master_key(&BASE64.encode([1u8; 16])),
            Err(CryptoError::InvalidKey)
        ));
        assert!(matches!(
            parse_master_key("not base64!!"),
            Err(CryptoError::Base64(_))
        ));
    }

    #[tokio::test]
    async fn test_store_round_trip_and_overwrite() {
        let pool = setup_test_db().await;
        let store = SealedSecretStore::connect(pool.clone(), &test_key()).await.unwrap();

        store.set("finnhub_key", "api_key", b"first").await.unwrap();
        store.set("finnhub_key", "api_key", b"second").await.unwrap();
        assert_eq!(store.get("finnhub_key").await.unwrap(), b"second");

        let (raw,): (String,) =
            sqlx::query_as("SELECT ciphertext FROM secrets WHERE secret_ref = 'finnhub_key'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(!raw.contains("second"));
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_read() {
        let pool = setup_test_db().await;
        let store = SealedSecretStore::connect(pool.clone(), &test_key()).await.unwrap();
        store.set("k", "api_key", b"value").await.unwrap();

        let other = SealedSecretStore::connect(pool, &BASE64.encode([9u8; 32]))
            .await
            .unwrap();
        assert!(other.get("k").await.is_err());
        assert!(other.get("missing").await.is_err());
    }
}
