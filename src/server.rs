//! Token protocol server.
//!
//! Mints one-time links, enforces identity binding on redemption and moves
//! plaintext between callers and the secret store. Rows are only ever
//! touched through [`TokenRepo`].

use crate::db::{token_prefix, DbPool, PendingToken, TokenRepo};
use crate::error::{AppError, AppResult};
use crate::notify::NotifyHooks;
use crate::secrets::{SecretGetter, SecretSetter};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Secret type used when the issuer does not name one.
pub const DEFAULT_SECRET_TYPE: &str = "api_key";

/// Default lifetime of human-scoped tokens.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Response for `POST /kuze/issue/human`.
#[derive(Debug, Clone, Serialize)]
pub struct HumanIssueResponse {
    pub link: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub secret_ref: String,
}

/// Response for `POST /kuze/issue/agent`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentIssueResponse {
    pub redeem_url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub secret_ref: String,
    pub agent_id: String,
}

/// Response for `GET /kuze/redeem/{token}`. `value` is standard base64.
#[derive(Serialize)]
pub struct RedeemResponse {
    pub secret_ref: String,
    pub secret_type: String,
    pub value: String,
}

impl std::fmt::Debug for RedeemResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeemResponse")
            .field("secret_ref", &self.secret_ref)
            .field("secret_type", &self.secret_type)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Shared state behind every token route.
pub struct TokenServer {
    pool: DbPool,
    base_url: String,
    ttl: Duration,
    setter: Option<Arc<dyn SecretSetter>>,
    getter: Option<Arc<dyn SecretGetter>>,
    hooks: NotifyHooks,
}

impl TokenServer {
    pub fn new(pool: DbPool, base_url: &str) -> Self {
        Self {
            pool,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl: DEFAULT_TTL,
            setter: None,
            getter: None,
            hooks: NotifyHooks::default(),
        }
    }

    /// Lifetime of human tokens. Agent tokens ignore this.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_secret_setter(mut self, setter: Arc<dyn SecretSetter>) -> Self {
        self.setter = Some(setter);
        self
    }

    pub fn with_secret_getter(mut self, getter: Arc<dyn SecretGetter>) -> Self {
        self.getter = Some(getter);
        self
    }

    pub fn with_hooks(mut self, hooks: NotifyHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Mint a web-form token for `secret_ref`.
    pub async fn issue_human(
        &self,
        secret_ref: &str,
        secret_type: Option<&str>,
    ) -> AppResult<HumanIssueResponse> {
        let secret_ref = secret_ref.trim();
        if secret_ref.is_empty() {
            return Err(AppError::EmptySecretRef);
        }
        let secret_type = secret_type_or_default(secret_type);

        let issued = TokenRepo::issue(&self.pool, secret_ref, secret_type, self.ttl).await?;
        info!(
            token = token_prefix(&issued.token),
            secret_ref, "issued human token"
        );

        Ok(HumanIssueResponse {
            link: format!("{}/s/{}", self.base_url, issued.token),
            token: issued.token,
            expires_at: issued.expires_at,
            secret_ref: secret_ref.to_string(),
        })
    }

    /// Mint a short-lived token redeemable only by `agent_id`.
    pub async fn issue_agent(
        &self,
        agent_id: &str,
        secret_ref: &str,
        secret_type: Option<&str>,
        purpose: Option<&str>,
    ) -> AppResult<AgentIssueResponse> {
        let agent_id = agent_id.trim();
        let secret_ref = secret_ref.trim();
        if agent_id.is_empty() {
            return Err(AppError::EmptyAgentId);
        }
        if secret_ref.is_empty() {
            return Err(AppError::EmptySecretRef);
        }
        let secret_type = secret_type_or_default(secret_type);

        let issued =
            TokenRepo::issue_agent(&self.pool, secret_ref, secret_type, agent_id, purpose).await?;
        info!(
            token = token_prefix(&issued.token),
            secret_ref,
            agent_id,
            purpose = purpose.unwrap_or(""),
            "issued agent token"
        );

        Ok(AgentIssueResponse {
            redeem_url: format!("{}/kuze/redeem/{}", self.base_url, issued.token),
            token: issued.token,
            expires_at: issued.expires_at,
            secret_ref: secret_ref.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    /// Check a web-form token without consuming it.
    pub async fn validate(&self, token: &str) -> AppResult<PendingToken> {
        TokenRepo::validate(&self.pool, token).await
    }

    /// Store a value typed into the web form.
    ///
    /// Validate and burn are separate steps with the store write between
    /// them, so two racing submissions can both write; only one burn wins.
    /// A failed burn after a successful write is logged, not returned.
    pub async fn accept_entry(&self, token: &str, value: &str) -> AppResult<PendingToken> {
        let setter = self.setter.as_ref().ok_or(AppError::NotConfigured)?;
        let pending = self.validate(token).await?;

        if value.trim().is_empty() {
            return Err(AppError::EmptySecretValue);
        }

        setter
            .set(&pending.secret_ref, &pending.secret_type, value.as_bytes())
            .await
            .map_err(|e| {
                error!(
                    token = pending.token_prefix(),
                    secret_ref = %pending.secret_ref,
                    "secret store write failed: {:#}", e
                );
                AppError::secret_backend("set")(e)
            })?;

        if let Err(e) = TokenRepo::burn(&self.pool, token).await {
            warn!(
                token = pending.token_prefix(),
                "burn after store failed: {}", e
            );
        }

        if let Err(e) = self.hooks.secret_stored(&pending.secret_ref) {
            warn!(secret_ref = %pending.secret_ref, "secret stored hook failed: {:#}", e);
        }

        info!(
            token = pending.token_prefix(),
            secret_ref = %pending.secret_ref,
            "secret stored via one-time link"
        );
        Ok(pending)
    }

    /// Redeem an agent token and return the secret it points at.
    ///
    /// The burn happens before the read; a read failure leaves the token
    /// consumed and the agent has to ask for a new one.
    pub async fn redeem(&self, token: &str, agent_id: &str) -> AppResult<RedeemResponse> {
        let getter = self.getter.as_ref().ok_or(AppError::NotConfigured)?;
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(AppError::MissingAgentId);
        }

        let pending = TokenRepo::redeem(&self.pool, token, agent_id).await?;

        let value = getter.get(&pending.secret_ref).await.map_err(|e| {
            error!(
                token = pending.token_prefix(),
                secret_ref = %pending.secret_ref,
                agent_id,
                "secret store read failed after burn: {:#}", e
            );
            AppError::secret_backend("get")(e)
        })?;
        let value = Zeroizing::new(value);

        info!(
            token = pending.token_prefix(),
            secret_ref = %pending.secret_ref,
            agent_id,
            "agent token redeemed"
        );

        Ok(RedeemResponse {
            secret_ref: pending.secret_ref,
            secret_type: pending.secret_type,
            value: BASE64.encode(value.as_slice()),
        })
    }

    /// Report every expired-unused token to the expiry hook, then delete all
    /// dead rows. Used tokens are removed without notification.
    pub async fn prune_expired_with_notify(&self) -> AppResult<u64> {
        let expired = TokenRepo::list_expired_unused(&self.pool).await?;
        for token in &expired {
            if let Err(e) = self.hooks.token_expired(token) {
                warn!(
                    token = token.token_prefix(),
                    secret_ref = %token.secret_ref,
                    "token expired hook failed: {:#}", e
                );
            }
        }

        let deleted = TokenRepo::prune_expired(&self.pool).await?;
        if deleted > 0 {
            info!(
                deleted,
                expired_unused = expired.len(),
                "pruned dead tokens"
            );
        }
        Ok(deleted)
    }
}

fn secret_type_or_default(secret_type: Option<&str>) -> &str {
    secret_type
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_SECRET_TYPE)
}

impl std::fmt::Debug for TokenServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenServer")
            .field("base_url", &self.base_url)
            .field("ttl", &self.ttl)
            .field("setter", &self.setter.is_some())
            .field("getter", &self.getter.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_test_db;
    use crate::secrets::MemorySecretStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    async fn test_server() -> (TokenServer, Arc<MemorySecretStore>) {
        let pool = setup_test_db().await;
        let store = Arc::new(MemorySecretStore::new());
        let server = TokenServer::new(pool, "https://kuze.example.com/")
            .with_secret_setter(store.clone())
            .with_secret_getter(store.clone());
        (server, store)
    }

    async fn expire(server: &TokenServer, token: &str) {
        TokenRepo::set_expiry(server.pool(), token, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_issue_human_builds_link() {
        let (server, _) = test_server().await;
        let resp = server.issue_human("openai_key", None).await.unwrap();
        assert_eq!(resp.link, format!("https://kuze.example.com/s/{}", resp.token));
        assert_eq!(resp.secret_ref, "openai_key");

        let pending = server.validate(&resp.token).await.unwrap();
        assert_eq!(pending.secret_type, DEFAULT_SECRET_TYPE);
    }

    #[tokio::test]
    async fn test_issue_rejects_empty_inputs() {
        let (server, _) = test_server().await;
        assert!(matches!(
            server.issue_human("  ", None).await,
            Err(AppError::EmptySecretRef)
        ));
        assert!(matches!(
            server.issue_agent("", "k", None, None).await,
            Err(AppError::EmptyAgentId)
        ));
        assert!(matches!(
            server.issue_agent("warren", "", None, None).await,
            Err(AppError::EmptySecretRef)
        ));
        assert_eq!(TokenRepo::count(server.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_agent_ttl_independent_of_server_ttl() {
        let (server, _) = test_server().await;
        let server = server.with_ttl(Duration::from_secs(24 * 3600));
        let resp = server
            .issue_agent("warren", "finnhub_key", Some("api_key"), None)
            .await
            .unwrap();
        assert!(resp.expires_at <= Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(
            resp.redeem_url,
            format!("https://kuze.example.com/kuze/redeem/{}", resp.token)
        );
    }

    #[tokio::test]
    async fn test_accept_entry_empty_value_keeps_token() {
        let (server, store) = test_server().await;
        let resp = server.issue_human("openai_key", None).await.unwrap();

        assert!(matches!(
            server.accept_entry(&resp.token, "   ").await,
            Err(AppError::EmptySecretValue)
        ));
        assert!(store.is_empty().await);
        server.validate(&resp.token).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_entry_stores_burns_and_notifies() {
        let pool = setup_test_db().await;
        let store = Arc::new(MemorySecretStore::new());
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = notified.clone();
        let server = TokenServer::new(pool, "https://kuze.example.com")
            .with_secret_setter(store.clone())
            .with_hooks(NotifyHooks::new().on_secret_stored(move |secret_ref| {
                sink.lock().unwrap().push(secret_ref.to_string());
                Ok(())
            }));

        let resp = server.issue_human("openai_key", None).await.unwrap();
        server.accept_entry(&resp.token, "sk-live-abc").await.unwrap();

        assert_eq!(store.get("openai_key").await.unwrap(), b"sk-live-abc");
        assert_eq!(*notified.lock().unwrap(), vec!["openai_key".to_string()]);
        assert!(matches!(
            server.accept_entry(&resp.token, "again").await,
            Err(AppError::TokenUsed)
        ));
    }

    #[tokio::test]
    async fn test_accept_entry_survives_failing_hook() {
        let (server, store) = test_server().await;
        let server = server.with_hooks(NotifyHooks::new().on_secret_stored(|_| {
            anyhow::bail!("chat unavailable")
        }));
        let resp = server.issue_human("k", None).await.unwrap();
        server.accept_entry(&resp.token, "v").await.unwrap();
        assert!(store.contains("k").await);
    }

    #[tokio::test]
    async fn test_accept_entry_without_setter() {
        let pool = setup_test_db().await;
        let server = TokenServer::new(pool, "https://kuze.example.com");
        let resp = server.issue_human("k", None).await.unwrap();
        assert!(matches!(
            server.accept_entry(&resp.token, "v").await,
            Err(AppError::NotConfigured)
        ));
        server.validate(&resp.token).await.unwrap();
    }

    /// Holds every write until `parties` writers have arrived.
    struct GatedSetter {
        gate: tokio::sync::Barrier,
        inner: Arc<MemorySecretStore>,
    }

    #[async_trait::async_trait]
    impl SecretSetter for GatedSetter {
        async fn set(&self, secret_ref: &str, secret_type: &str, value: &[u8]) -> anyhow::Result<()> {
            self.gate.wait().await;
            self.inner.set(secret_ref, secret_type, value).await
        }
    }

    struct FailingSetter;

    #[async_trait::async_trait]
    impl SecretSetter for FailingSetter {
        async fn set(&self, _: &str, _: &str, _: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("vault sealed")
        }
    }

    #[tokio::test]
    async fn test_accept_entry_keeps_surrounding_whitespace() {
        let (server, store) = test_server().await;
        let resp = server.issue_human("pw", None).await.unwrap();
        server.accept_entry(&resp.token, "  hunter2 ").await.unwrap();
        assert_eq!(store.get("pw").await.unwrap(), b"  hunter2 ");
    }

    #[tokio::test]
    async fn test_accept_entry_store_failure_keeps_token() {
        let pool = setup_test_db().await;
        let server = TokenServer::new(pool, "https://kuze.example.com")
            .with_secret_setter(Arc::new(FailingSetter));
        let resp = server.issue_human("k", None).await.unwrap();

        let err = server.accept_entry(&resp.token, "v").await.unwrap_err();
        assert!(matches!(err, AppError::SecretBackend { op: "set", .. }));
        server.validate(&resp.token).await.unwrap();
    }

    #[tokio::test]
    async fn test_racing_entries_both_write_one_burns() {
        let pool = setup_test_db().await;
        let store = Arc::new(MemorySecretStore::new());
        let setter = Arc::new(GatedSetter {
            gate: tokio::sync::Barrier::new(2),
            inner: store.clone(),
        });
        let server = Arc::new(
            TokenServer::new(pool, "https://kuze.example.com").with_secret_setter(setter),
        );
        let resp = server.issue_human("k", None).await.unwrap();

        // The gate only opens once both submissions have passed validation.
        let entries: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|value| {
                let server = server.clone();
                let token = resp.token.clone();
                tokio::spawn(async move { server.accept_entry(&token, value).await })
            })
            .collect();
        for entry in entries {
            entry.await.unwrap().unwrap();
        }

        let stored = store.get("k").await.unwrap();
        assert!(stored == b"first" || stored == b"second");
        assert!(matches!(
            server.validate(&resp.token).await,
            Err(AppError::TokenUsed)
        ));
    }

    #[tokio::test]
    async fn test_redeem_returns_base64_value() {
        let (server, store) = test_server().await;
        store.set("finnhub_key", "api_key", b"sk-test-value").await.unwrap();
        let resp = server
            .issue_agent("warren", "finnhub_key", None, None)
            .await
            .unwrap();

        let redeemed = server.redeem(&resp.token, "warren").await.unwrap();
        assert_eq!(redeemed.value, BASE64.encode("sk-test-value"));
        assert_eq!(redeemed.secret_type, "api_key");
        assert!(!format!("{redeemed:?}").contains(&redeemed.value));

        assert!(server.redeem(&resp.token, "warren").await.unwrap_err().is_dead_token());
    }

    #[tokio::test]
    async fn test_redeem_missing_secret_consumes_token() {
        let (server, _) = test_server().await;
        let resp = server.issue_agent("warren", "nothing_here", None, None).await.unwrap();

        assert!(matches!(
            server.redeem(&resp.token, "warren").await,
            Err(AppError::SecretBackend { op: "get", .. })
        ));
        assert!(matches!(
            server.redeem(&resp.token, "warren").await,
            Err(AppError::TokenUsed)
        ));
    }

    #[tokio::test]
    async fn test_prune_notifies_only_expired_unused() {
        let pool = setup_test_db().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let store = Arc::new(MemorySecretStore::new());
        let server = TokenServer::new(pool, "https://kuze.example.com")
            .with_secret_setter(store)
            .with_hooks(NotifyHooks::new().on_token_expired(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        let expired_a = server.issue_human("a", None).await.unwrap();
        let expired_b = server.issue_agent("warren", "b", None, None).await.unwrap();
        let used = server.issue_human("c", None).await.unwrap();
        server.accept_entry(&used.token, "v").await.unwrap();
        expire(&server, &expired_a.token).await;
        expire(&server, &expired_b.token).await;
        expire(&server, &used.token).await;

        let deleted = server.prune_expired_with_notify().await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(TokenRepo::count(server.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_continues_when_hook_fails() {
        let (server, _) = test_server().await;
        let server = server.with_hooks(
            NotifyHooks::new().on_token_expired(|_| anyhow::bail!("chat unavailable")),
        );
        let resp = server.issue_human("a", None).await.unwrap();
        expire(&server, &resp.token).await;

        assert_eq!(server.prune_expired_with_notify().await.unwrap(), 1);
    }
}
