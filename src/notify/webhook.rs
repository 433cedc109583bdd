//! Chat webhook notifier.
//!
//! Posts `{"content": "..."}` to a Discord/Slack-compatible incoming webhook.
//! Each post runs on its own task so the token path never waits on chat.
//! Short-lived processes call [`WebhookNotifier::flush`] before exiting.

use crate::db::PendingToken;
use crate::error::{AppError, AppResult};
use crate::notify::NotifyHooks;
use reqwest::Client;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// Client for a chat incoming webhook
#[derive(Debug)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    in_flight: Mutex<JoinSet<()>>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            in_flight: Mutex::new(JoinSet::new()),
        })
    }

    /// Hooks that forward both lifecycle events to this webhook.
    pub fn hooks(self: Arc<Self>) -> NotifyHooks {
        let stored = self.clone();
        let expired = self;
        NotifyHooks::new()
            .on_secret_stored(move |secret_ref| {
                stored.dispatch(Self::secret_stored_message(secret_ref))
            })
            .on_token_expired(move |token| expired.dispatch(Self::token_expired_message(token)))
    }

    pub fn secret_stored_message(secret_ref: &str) -> String {
        format!("Secret `{secret_ref}` was stored via one-time link.")
    }

    /// Never includes the full token.
    pub fn token_expired_message(token: &PendingToken) -> String {
        let mut message = format!(
            "One-time link for `{}` expired unused (token {}…).",
            token.secret_ref,
            token.token_prefix()
        );
        if let Some(agent_id) = &token.agent_id {
            message.push_str(&format!(" Agent: `{agent_id}`."));
        }
        if let Some(purpose) = &token.purpose {
            message.push_str(&format!(" Purpose: {purpose}."));
        }
        message
    }

    /// Fire and forget. Fails only when called outside a Tokio runtime.
    fn dispatch(&self, content: String) -> anyhow::Result<()> {
        let handle = tokio::runtime::Handle::try_current()?;
        let client = self.client.clone();
        let url = self.url.clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn_on(
            async move {
                let result = client
                    .post(&url)
                    .json(&WebhookPayload { content: &content })
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status());
                match result {
                    Ok(_) => debug!("webhook notification delivered"),
                    Err(e) => warn!("webhook notification failed: {}", e),
                }
            },
            &handle,
        );
        Ok(())
    }

    /// Wait for every post dispatched so far to finish.
    pub async fn flush(&self) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *in_flight)
        };
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!("webhook task failed: {}", e);
            }
        }
    }
}
