use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sqlx::FromRow;

/// Bytes of OS randomness behind every token.
pub const TOKEN_BYTES: usize = 32;

/// Raw row of the `tokens` table.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token: String,
    pub secret_ref: String,
    pub secret_type: String,
    pub created_at: String,
    pub expires_at: String,
    pub used: bool,
    pub agent_id: Option<String>,
    pub purpose: Option<String>,
}

impl TokenRow {
    pub fn expires_at(&self) -> AppResult<DateTime<Utc>> {
        parse_timestamp(&self.expires_at)
    }

    /// Empty or missing agent id means the token belongs to the web form.
    pub fn bound_agent(&self) -> &str {
        self.agent_id.as_deref().unwrap_or("")
    }
}

/// A token as seen by callers of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingToken {
    pub token: String,
    pub secret_ref: String,
    pub secret_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub purpose: Option<String>,
}

impl PendingToken {
    pub fn is_agent_scoped(&self) -> bool {
        self.agent_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.token)
    }
}

impl TryFrom<TokenRow> for PendingToken {
    type Error = AppError;

    fn try_from(row: TokenRow) -> AppResult<Self> {
        Ok(Self {
            created_at: parse_timestamp(&row.created_at)?,
            expires_at: parse_timestamp(&row.expires_at)?,
            token: row.token,
            secret_ref: row.secret_ref,
            secret_type: row.secret_type,
            agent_id: row.agent_id.filter(|id| !id.is_empty()),
            purpose: row.purpose.filter(|p| !p.is_empty()),
        })
    }
}

/// Result of minting a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Fields for a row about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewToken {
    pub secret_ref: String,
    pub secret_type: String,
    pub agent_id: Option<String>,
    pub purpose: Option<String>,
}

impl NewToken {
    /// 32 bytes from the OS CSPRNG, URL-safe base64 without padding.
    pub fn generate_token() -> AppResult<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AppError::Entropy(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// First eight characters of a token, the only part that may be logged.
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Fixed-width RFC3339 so that text comparison in SQL is chronological.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::internal(format!("bad timestamp {raw:?}: {e}")))
}
