use crate::db::token_prefix;
use crate::error::AppError;
use crate::server::{AgentIssueResponse, HumanIssueResponse, RedeemResponse, TokenServer};
use crate::web::templates::{
    render, EntryFormPage, ErrorPage, ExpiredPage, StoredPage, EMPTY_VALUE_ERROR,
};
use axum::{
    body::Body,
    extract::{Form, MatchedPath, Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, Span};

/// Header an agent uses to assert its identity on redemption.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Shared state for every route
pub type AppState = Arc<TokenServer>;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct IssueHumanParams {
    #[serde(default)]
    pub secret_ref: String,
    #[serde(default, rename = "type")]
    pub secret_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssueAgentParams {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub secret_ref: String,
    #[serde(default, rename = "type")]
    pub secret_type: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
}

/// Body of the entry form POST
#[derive(Deserialize)]
pub struct EntryForm {
    #[serde(default)]
    pub secret_value: String,
}

/// POST /kuze/issue/human
pub async fn issue_human(
    State(server): State<AppState>,
    Query(params): Query<IssueHumanParams>,
) -> Result<Json<HumanIssueResponse>, AppError> {
    let resp = server
        .issue_human(&params.secret_ref, params.secret_type.as_deref())
        .await
        .inspect_err(log_internal)?;
    Ok(Json(resp))
}

/// POST /kuze/issue/agent
pub async fn issue_agent(
    State(server): State<AppState>,
    Query(params): Query<IssueAgentParams>,
) -> Result<Json<AgentIssueResponse>, AppError> {
    let resp = server
        .issue_agent(
            &params.agent_id,
            &params.secret_ref,
            params.secret_type.as_deref(),
            params.purpose.as_deref(),
        )
        .await
        .inspect_err(log_internal)?;
    Ok(Json(resp))
}

/// GET /s/{token}: show the entry form while the token is pending.
pub async fn entry_form(State(server): State<AppState>, Path(token): Path<String>) -> Response {
    match server.validate(&token).await {
        Ok(pending) => render(
            StatusCode::OK,
            EntryFormPage {
                secret_ref: &pending.secret_ref,
                token: &token,
                error: "",
            },
        ),
        Err(e) => error_page(&token, e),
    }
}

/// POST /s/{token}: hand the typed value to the secret store.
pub async fn submit_entry(
    State(server): State<AppState>,
    Path(token): Path<String>,
    Form(form): Form<EntryForm>,
) -> Response {
    match server.accept_entry(&token, &form.secret_value).await {
        Ok(pending) => render(
            StatusCode::OK,
            StoredPage {
                secret_ref: &pending.secret_ref,
            },
        ),
        Err(AppError::EmptySecretValue) => match server.validate(&token).await {
            Ok(pending) => render(
                StatusCode::OK,
                EntryFormPage {
                    secret_ref: &pending.secret_ref,
                    token: &token,
                    error: EMPTY_VALUE_ERROR,
                },
            ),
            Err(e) => error_page(&token, e),
        },
        Err(e) => error_page(&token, e),
    }
}

/// GET /kuze/redeem/{token}: agent redemption, identity in `X-Agent-ID`.
pub async fn redeem(
    State(server): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let agent_id = headers
        .get(AGENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(AppError::MissingAgentId)?;

    let resp = server
        .redeem(&token, agent_id)
        .await
        .inspect_err(log_internal)?;
    Ok(no_store(Json::<RedeemResponse>(resp)))
}

fn no_store(body: impl IntoResponse) -> Response {
    ([(header::CACHE_CONTROL, "no-store")], body).into_response()
}

/// Dead tokens all get the same page; everything else is a server fault.
fn error_page(token: &str, err: AppError) -> Response {
    if err.is_dead_token() {
        return render(StatusCode::GONE, ExpiredPage);
    }
    error!(token = token_prefix(token), "entry flow failed: {}", err);
    let status = err.status_code();
    let message = match err {
        AppError::NotConfigured => "Secret entry is not enabled on this server.",
        _ => "The secret could not be stored. Ask for a new link.",
    };
    render(status, ErrorPage { message })
}

fn log_internal(err: &AppError) {
    if err.status_code().is_server_error() {
        error!("token request failed: {}", err);
    }
}

/// Routes that mint tokens. Meant for trusted network segments only.
pub fn admin_router(server: AppState) -> Router {
    Router::new()
        .route("/kuze/issue/human", post(issue_human))
        .route("/kuze/issue/agent", post(issue_agent))
        .with_state(server)
}

/// Routes reachable by humans (entry form) and agents (redemption).
pub fn public_router(server: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/s/{token}", get(entry_form).post(submit_entry))
        .route("/kuze/redeem/{token}", get(redeem))
        .with_state(server)
}

/// Create the full router with both surfaces on one listener
pub fn create_router(server: AppState) -> Router {
    with_tracing(public_router(server.clone()).merge(admin_router(server)))
}

/// Request tracing that never records a raw token.
pub fn with_tracing(router: Router) -> Router {
    router.layer(TraceLayer::new_for_http().make_span_with(request_span))
}

fn request_span(req: &Request<Body>) -> Span {
    tracing::debug_span!(
        "request",
        method = %req.method(),
        path = %span_path(req),
        version = ?req.version()
    )
}

/// Route template when routing matched, else the path with token segments cut
/// down to their prefix.
fn span_path<B>(req: &Request<B>) -> String {
    match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => redact_path(req.uri().path()),
    }
}

fn redact_path(path: &str) -> String {
    for route in ["/s/", "/kuze/redeem/"] {
        if let Some(token) = path.strip_prefix(route) {
            return format!("{}{}…", route, token_prefix(token));
        }
    }
    path.to_string()
}
