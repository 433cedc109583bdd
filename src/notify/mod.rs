//! Lifecycle notification hooks.
//!
//! The token service reports two events to whoever wants them (usually a
//! chat notifier) without depending on that layer: a secret was stored
//! through the web form, and a token expired without ever being used.
//! Hooks run synchronously on the calling task, so they must hand any slow
//! work off (see [`WebhookNotifier`]). Their errors are logged and dropped.

pub mod webhook;

use crate::db::PendingToken;
use std::sync::Arc;

pub use webhook::WebhookNotifier;

pub type SecretStoredHook = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;
pub type TokenExpiredHook = Arc<dyn Fn(&PendingToken) -> anyhow::Result<()> + Send + Sync>;

/// Injected callbacks; a missing hook is a no-op.
#[derive(Clone, Default)]
pub struct NotifyHooks {
    pub on_secret_stored: Option<SecretStoredHook>,
    pub on_token_expired: Option<TokenExpiredHook>,
}

impl NotifyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_secret_stored<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_secret_stored = Some(Arc::new(hook));
        self
    }

    pub fn on_token_expired<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PendingToken) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_token_expired = Some(Arc::new(hook));
        self
    }

    pub(crate) fn secret_stored(&self, secret_ref: &str) -> anyhow::Result<()> {
        match &self.on_secret_stored {
            Some(hook) => hook(secret_ref),
            None => Ok(()),
        }
    }

    pub(crate) fn token_expired(&self, token: &PendingToken) -> anyhow::Result<()> {
        match &self.on_token_expired {
            Some(hook) => hook(token),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for NotifyHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyHooks")
            .field("on_secret_stored", &self.on_secret_stored.is_some())
            .field("on_token_expired", &self.on_token_expired.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_missing_hooks_are_noops() {
        let hooks = NotifyHooks::new();
        assert!(hooks.secret_stored("k").is_ok());
        assert_eq!(
            format!("{hooks:?}"),
            "NotifyHooks { on_secret_stored: false, on_token_expired: false }"
        );
    }

    #[test]
    fn test_hook_receives_secret_ref() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hooks = NotifyHooks::new().on_secret_stored(move |secret_ref| {
            assert_eq!(secret_ref, "openai_key");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.secret_stored("openai_key").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_errors_are_returned_to_caller() {
        let hooks = NotifyHooks::new().on_secret_stored(|_| anyhow::bail!("chat down"));
        assert!(hooks.secret_stored("k").is_err());
    }
}
