use thiserror::Error;

/// Text shown for every dead token, whatever the underlying cause.
pub const DEAD_TOKEN_MESSAGE: &str = "link no longer valid";

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("token not found")]
    TokenNotFound,

    #[error("token expired")]
    TokenExpired,

    #[error("token already used")]
    TokenUsed,

    #[error("agent id does not match token")]
    AgentIdMismatch,

    #[error("missing X-Agent-ID header")]
    MissingAgentId,

    #[error("secret_ref is required")]
    EmptySecretRef,

    #[error("agent_id is required")]
    EmptyAgentId,

    #[error("secret value is empty")]
    EmptySecretValue,

    #[error("entropy source failed: {0}")]
    Entropy(String),

    #[error("storage error during {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("secret store error during {op}: {source}")]
    SecretBackend {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("secret store not configured")]
    NotConfigured,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a database error with the name of the operation that produced it.
    pub fn storage(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Storage { op, source }
    }

    pub fn secret_backend(op: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::SecretBackend { op, source }
    }

    /// Not found, expired and used all collapse into one external response.
    pub fn is_dead_token(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound | Self::TokenExpired | Self::TokenUsed
        )
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::TokenNotFound | Self::TokenExpired | Self::TokenUsed => StatusCode::GONE,
            Self::AgentIdMismatch => StatusCode::FORBIDDEN,
            Self::MissingAgentId => StatusCode::UNAUTHORIZED,
            Self::EmptySecretRef | Self::EmptyAgentId | Self::EmptySecretValue => {
                StatusCode::BAD_REQUEST
            }
            Self::NotConfigured => StatusCode::NOT_IMPLEMENTED,
            Self::Config(_)
            | Self::Entropy(_)
            | Self::Storage { .. }
            | Self::SecretBackend { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to an untrusted caller.
    pub fn public_message(&self) -> String {
        match self {
            e if e.is_dead_token() => DEAD_TOKEN_MESSAGE.to_string(),
            Self::Config(_)
            | Self::Entropy(_)
            | Self::Storage { .. }
            | Self::SecretBackend { .. }
            | Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_dead_token_errors_share_status_and_message() {
        for err in [AppError::TokenNotFound, AppError::TokenExpired, AppError::TokenUsed] {
            assert!(err.is_dead_token());
            assert_eq!(err.status_code(), StatusCode::GONE);
            assert_eq!(err.public_message(), DEAD_TOKEN_MESSAGE);
        }
    }

    #[test]
    fn test_identity_errors_are_distinct() {
        assert!(!AppError::AgentIdMismatch.is_dead_token());
        assert_eq!(AppError::AgentIdMismatch.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::MissingAgentId.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_backend_errors_hide_details() {
        let err = AppError::secret_backend("get")(anyhow::anyhow!("disk on fire at /var/x"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "internal error");
        assert!(err.to_string().contains("during get"));

        let resp = AppError::NotConfigured.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
