use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type DbPool = Pool<Sqlite>;

/// Agent tokens only bridge one immediate HTTP round-trip.
pub const AGENT_TOKEN_TTL: Duration = Duration::from_secs(60);

const TOKEN_COLUMNS: &str =
    "token, secret_ref, secret_type, created_at, expires_at, used, agent_id, purpose";

/// Database operations for one-time tokens.
///
/// Every single-use guarantee here is a conditional UPDATE whose affected
/// row count decides the winner; there is no in-process locking.
pub struct TokenRepo;

impl TokenRepo {
    /// Mint a human-scoped token that lives for `ttl`.
    pub async fn issue(
        pool: &DbPool,
        secret_ref: &str,
        secret_type: &str,
        ttl: Duration,
    ) -> AppResult<IssuedToken> {
        let new_token = NewToken {
            secret_ref: secret_ref.to_string(),
            secret_type: secret_type.to_string(),
            agent_id: None,
            purpose: None,
        };
        Self::insert(pool, new_token, ttl).await
    }

    /// Mint an agent-scoped token. The lifetime is always [`AGENT_TOKEN_TTL`].
    pub async fn issue_agent(
        pool: &DbPool,
        secret_ref: &str,
        secret_type: &str,
        agent_id: &str,
        purpose: Option<&str>,
    ) -> AppResult<IssuedToken> {
        let new_token = NewToken {
            secret_ref: secret_ref.to_string(),
            secret_type: secret_type.to_string(),
            agent_id: Some(agent_id.to_string()),
            purpose: purpose.filter(|p| !p.is_empty()).map(str::to_string),
        };
        Self::insert(pool, new_token, AGENT_TOKEN_TTL).await
    }

    async fn insert(pool: &DbPool, new_token: NewToken, ttl: Duration) -> AppResult<IssuedToken> {
        if ttl.is_zero() {
            return Err(AppError::internal("token ttl must be positive"));
        }
        let token = NewToken::generate_token()?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::internal(format!("ttl out of range: {e}")))?;
        let expires_at = now + ttl;

        sqlx::query(
            r#"
            INSERT INTO tokens (token, secret_ref, secret_type, created_at, expires_at, used, agent_id, purpose)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&token)
        .bind(&new_token.secret_ref)
        .bind(&new_token.secret_type)
        .bind(format_timestamp(now))
        .bind(format_timestamp(expires_at))
        .bind(&new_token.agent_id)
        .bind(&new_token.purpose)
        .execute(pool)
        .await
        .map_err(AppError::storage("issue token"))?;

        debug!(
            token = token_prefix(&token),
            secret_ref = %new_token.secret_ref,
            agent_id = ?new_token.agent_id,
            "token issued"
        );

        Ok(IssuedToken { token, expires_at })
    }

    async fn fetch(pool: &DbPool, token: &str) -> AppResult<Option<TokenRow>> {
        sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = ?"
        ))
        .bind(token)
        .fetch_optional(pool)
        .await
        .map_err(AppError::storage("fetch token"))
    }

    /// Read-only check that the token is still pending.
    pub async fn validate(pool: &DbPool, token: &str) -> AppResult<PendingToken> {
        let row = Self::fetch(pool, token)
            .await?
            .ok_or(AppError::TokenNotFound)?;

        if row.used {
            return Err(AppError::TokenUsed);
        }
        if Utc::now() >= row.expires_at()? {
            return Err(AppError::TokenExpired);
        }

        row.try_into()
    }

    /// Flip `used` from false to true. Zero affected rows means someone else
    /// won, or the token never existed.
    pub async fn burn(pool: &DbPool, token: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE tokens SET used = 1 WHERE token = ? AND used = 0")
            .bind(token)
            .execute(pool)
            .await
            .map_err(AppError::storage("burn token"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::TokenUsed);
        }
        Ok(())
    }

    /// Identity check and burn in a single conditional UPDATE.
    ///
    /// A mismatched identity leaves the token live.
    pub async fn redeem(
        pool: &DbPool,
        token: &str,
        claimed_agent_id: &str,
    ) -> AppResult<PendingToken> {
        let now = Utc::now();
        let burned = sqlx::query_as::<_, TokenRow>(&format!(
            r#"
            UPDATE tokens SET used = 1
            WHERE token = ? AND agent_id = ? AND used = 0 AND expires_at > ?
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(claimed_agent_id)
        .bind(format_timestamp(now))
        .fetch_optional(pool)
        .await
        .map_err(AppError::storage("redeem token"))?;

        if let Some(row) = burned {
            return row.try_into();
        }

        // Nothing matched; work out why for the caller.
        let row = Self::fetch(pool, token)
            .await?
            .ok_or(AppError::TokenNotFound)?;
        if row.used {
            return Err(AppError::TokenUsed);
        }
        if now >= row.expires_at()? {
            return Err(AppError::TokenExpired);
        }
        let bound = row.bound_agent();
        if bound.is_empty() || bound != claimed_agent_id {
            warn!(
                token = token_prefix(token),
                claimed = %claimed_agent_id,
                "agent id mismatch on redemption"
            );
            return Err(AppError::AgentIdMismatch);
        }
        // Matched identity but lost the race between the UPDATE and this read.
        Err(AppError::TokenUsed)
    }

    /// Tokens that died of old age without ever being used.
    pub async fn list_expired_unused(pool: &DbPool) -> AppResult<Vec<PendingToken>> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE used = 0 AND expires_at < ? ORDER BY expires_at"
        ))
        .bind(format_timestamp(Utc::now()))
        .fetch_all(pool)
        .await
        .map_err(AppError::storage("list expired tokens"))?;

        rows.into_iter().map(PendingToken::try_from).collect()
    }

    /// Delete every used or expired row. Returns the number deleted.
    pub async fn prune_expired(pool: &DbPool) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE used = 1 OR expires_at < ?")
            .bind(format_timestamp(Utc::now()))
            .execute(pool)
            .await
            .map_err(AppError::storage("prune tokens"))?;

        Ok(result.rows_affected())
    }

    pub async fn count(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tokens")
            .fetch_one(pool)
            .await
            .map_err(AppError::storage("count tokens"))?;
        Ok(count)
    }

    /// Move a token's expiry. Used by tests and operators to retire links early.
    pub async fn set_expiry(pool: &DbPool, token: &str, expires_at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE tokens SET expires_at = ? WHERE token = ?")
            .bind(format_timestamp(expires_at))
            .bind(token)
            .execute(pool)
            .await
            .map_err(AppError::storage("set token expiry"))?;
        Ok(())
    }
}

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> AppResult<DbPool> {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(AppError::storage("open memory database"))?;
    init_db(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    memory_pool().await.expect("Failed to create in-memory database")
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            token TEXT PRIMARY KEY NOT NULL,
            secret_ref TEXT NOT NULL,
            secret_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            used BOOLEAN NOT NULL DEFAULT 0,
            agent_id TEXT,
            purpose TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::storage("migrate"))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON tokens(expires_at)")
        .execute(pool)
        .await
        .map_err(AppError::storage("migrate"))?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_used ON tokens(used)")
        .execute(pool)
        .await
        .map_err(AppError::storage("migrate"))?;

    info!("Database migrations complete");
    Ok(())
}
