//! HTTP surface for Switchboard.
//!
//! Named functions live under `/functions/v1/{name}` and keep the dashboard's
//! existing call shape. Connection management lives under `/integrations`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use switchboard_core::{
    bearer_token, ConfigRequest, Core, ExchangeRequest, Provider, SessionUser, SessionVerifier,
};

pub mod error;
pub mod functions;

pub use error::{ApiError, ErrorBody};
pub use functions::EdgeFunction;

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
    pub sessions: Arc<dyn SessionVerifier>,
}

impl AppState {
    pub fn new(core: Core, sessions: impl SessionVerifier + 'static) -> Self {
        Self {
            core: Arc::new(core),
            sessions: Arc::new(sessions),
        }
    }

    async fn require_session(&self, headers: &HeaderMap) -> switchboard_core::Result<SessionUser> {
        let token = bearer_token(header_str(headers, AUTHORIZATION))?;
        self.sessions.verify(token).await
    }

    /// Session when the caller sent a valid one; config calls work without it.
    async fn optional_session(&self, headers: &HeaderMap) -> Option<SessionUser> {
        let token = bearer_token(header_str(headers, AUTHORIZATION)).ok()?;
        match self.sessions.verify(token).await {
            Ok(user) => Some(user),
            Err(err) => {
                debug!("ignoring session on anonymous call: {}", err);
                None
            }
        }
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/functions/v1/{function}", get(call_function).post(call_function))
        .route("/integrations", get(list_integrations))
        .route(
            "/integrations/{provider}",
            get(integration_status).delete(disconnect),
        )
        .route("/integrations/{provider}/webhook", put(set_webhook))
        .route("/integrations/{provider}/merge", post(link_merge_account))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn call_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let function: EdgeFunction = name
        .parse()
        .map_err(|message: String| ApiError::new(StatusCode::NOT_FOUND, message))?;
    info!("function {} invoked", function);

    run_function(&state, function, &headers, &body)
        .await
        .map_err(|err| {
            ApiError::from_function(err, function.failure_status())
                .with_detail(function.failure_detail())
        })
}

async fn run_function(
    state: &AppState,
    function: EdgeFunction,
    headers: &HeaderMap,
    body: &[u8],
) -> switchboard_core::Result<Response> {
    let session = if function.requires_session() {
        Some(state.require_session(headers).await?)
    } else {
        state.optional_session(headers).await
    };

    match function {
        EdgeFunction::Config(provider) => {
            let request = ConfigRequest {
                origin: header_str(headers, ORIGIN),
                user_email: session.as_ref().and_then(|s| s.email.as_deref()),
            };
            let config = state.core.client_config(provider, &request).await?;
            Ok(Json(config).into_response())
        }
        EdgeFunction::Exchange(provider) => {
            let user = signed_in(session)?;
            let request = parse_exchange(body)?;
            let response = state.core.connect(&user.id, provider, &request).await?;
            Ok(Json(response).into_response())
        }
        EdgeFunction::Fetch(kind) => {
            let user = signed_in(session)?;
            let feed = state.core.fetch_feed(&user.id, kind).await?;
            Ok(Json(feed).into_response())
        }
    }
}

fn signed_in(session: Option<SessionUser>) -> switchboard_core::Result<SessionUser> {
    session.ok_or_else(|| switchboard_core::Error::unauthorized("No authorization header"))
}

fn parse_exchange(body: &[u8]) -> switchboard_core::Result<ExchangeRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ExchangeRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| switchboard_core::Error::InvalidRequest(format!("Invalid request body: {}", err)))
}

fn parse_provider(raw: &str) -> ApiResult<Provider> {
    raw.parse()
        .map_err(|err: anyhow::Error| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))
}

async fn list_integrations(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let user = state.require_session(&headers).await?;
    let statuses = state.core.status(&user.id).await?;
    Ok(Json(json!({ "integrations": statuses })).into_response())
}

async fn integration_status(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let provider = parse_provider(&provider)?;
    let user = state.require_session(&headers).await?;
    let status = state.core.provider_status(&user.id, provider).await?;
    Ok(Json(status).into_response())
}

async fn disconnect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let provider = parse_provider(&provider)?;
    let user = state.require_session(&headers).await?;
    state.core.disconnect(&user.id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    webhook_url: String,
}

async fn set_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let provider = parse_provider(&provider)?;
    let user = state.require_session(&headers).await?;
    let body: WebhookBody = serde_json::from_slice(&body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "webhook_url is required"))?;
    let status = state.core.set_webhook(&user.id, provider, &body.webhook_url).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
struct MergeLinkBody {
    public_token: String,
}

async fn link_merge_account(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let provider = parse_provider(&provider)?;
    if provider != Provider::Slack {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{} is not linked through Merge", provider.display_name()),
        ));
    }
    let user = state.require_session(&headers).await?;
    let body: MergeLinkBody = serde_json::from_slice(&body)
        .ok()
        .filter(|b: &MergeLinkBody| !b.public_token.trim().is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "public_token is required"))?;
    let status = state
        .core
        .link_merge_account(&user.id, body.public_token.trim())
        .await?;
    Ok(Json(status).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exchange_body() {
        let request = parse_exchange(b"").unwrap();
        assert!(request.code.is_none());

        let request = parse_exchange(br#"{"code":"abc","redirectUri":"https://a/cb"}"#).unwrap();
        assert_eq!(request.code.as_deref(), Some("abc"));
        assert_eq!(request.redirect_uri.as_deref(), Some("https://a/cb"));

        assert!(parse_exchange(b"{not json").is_err());
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("gmail").unwrap(), Provider::Google);
        assert_eq!(parse_provider("linear").unwrap_err().status, StatusCode::NOT_FOUND);
    }
}
