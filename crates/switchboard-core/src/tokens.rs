//! Access-token freshness for providers that issue expiring tokens.

use chrono::{Duration, Utc};
use switchboard_auth_bridge::{AuthToken, Provider};
use switchboard_store::{Integration, TokenUpdate};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::providers::ConnectorContext;

/// Tokens expiring within this window are refreshed before use.
pub const STALE_AFTER_SECS: i64 = 60;

pub const GMAIL_RECONNECT: &str = "Authentication failed. Please reconnect your Gmail account.";

pub fn is_stale(integration: &Integration) -> bool {
    integration
        .expires_at
        .map(|exp| exp <= Utc::now() + Duration::seconds(STALE_AFTER_SECS))
        .unwrap_or(false)
}

/// Return a usable access token, refreshing and persisting it first when stale.
pub async fn ensure_fresh(ctx: &ConnectorContext<'_>, integration: &Integration) -> Result<String> {
    let current = integration
        .access_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::NotConnected("No Gmail integration found".to_string()))?;

    if !is_stale(integration) {
        return Ok(current);
    }

    info!("{} token is stale, refreshing", integration.provider);
    let refreshed = refresh(ctx, integration).await?;
    Ok(refreshed.access_token)
}

/// Exchange the stored refresh token for a new access token and persist it.
/// A response without a new refresh token keeps the stored one.
pub async fn refresh(ctx: &ConnectorContext<'_>, integration: &Integration) -> Result<AuthToken> {
    let provider: Provider = integration.provider.parse()?;
    let refresh_token = integration
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::upstream(GMAIL_RECONNECT))?;

    let oauth = ctx
        .provider_config(provider)?
        .oauth_config(None)
        .ok_or_else(|| Error::MissingConfiguration("Missing Google OAuth configuration".to_string()))?;

    let token = ctx
        .bridge
        .refresh_token(provider, refresh_token, &oauth)
        .await
        .map_err(|err| {
            warn!("{} token refresh failed: {}", provider, err);
            Error::upstream(GMAIL_RECONNECT)
        })?;

    let update = TokenUpdate {
        access_token: token.access_token.clone(),
        refresh_token: token.refresh_token.clone(),
        expires_at: token.expires_at,
    };
    ctx.store
        .update_tokens(&integration.user_id, &integration.provider, &update)
        .await?;
    info!(
        "persisted refreshed {} token (new refresh token: {})",
        provider,
        token.refresh_token.is_some()
    );
    Ok(token)
}

/// Response of a Google API call plus the token that produced it, which
/// differs from the input after a forced refresh.
pub struct GoogleApiResult {
    pub token: String,
    pub response: reqwest::Response,
}

/// Call a Google API with `token`. A 401 answer triggers one forced refresh
/// and a retry when a refresh token is stored.
pub async fn call_google_api<F>(
    label: &str,
    ctx: &ConnectorContext<'_>,
    integration: &Integration,
    token: &str,
    builder_fn: F,
) -> Result<GoogleApiResult>
where
    F: Fn(&str) -> reqwest::RequestBuilder,
{
    let response = builder_fn(token).send().await?;
    let can_refresh = integration
        .refresh_token
        .as_deref()
        .is_some_and(|t| !t.is_empty());

    if response.status().as_u16() != 401 || !can_refresh {
        return Ok(GoogleApiResult {
            token: token.to_string(),
            response,
        });
    }

    warn!("{}: access token rejected, forcing refresh", label);
    let refreshed = refresh(ctx, integration).await?;
    let response = builder_fn(&refreshed.access_token).send().await?;
    Ok(GoogleApiResult {
        token: refreshed.access_token,
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{spawn_upstream, Harness};
    use axum::extract::Form;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    fn token_router() -> Router {
        Router::new()
            .route(
                "/token",
                post(|Form(body): Form<HashMap<String, String>>| async move {
                    assert_eq!(body.get("grant_type").map(String::as_str), Some("refresh_token"));
                    assert_eq!(body.get("refresh_token").map(String::as_str), Some("stored-refresh"));
                    Json(serde_json::json!({
                        "access_token": "fresh-token",
                        "token_type": "Bearer",
                        "expires_in": 3600
                    }))
                }),
            )
            .route(
                "/protected",
                get(|headers: HeaderMap| async move {
                    if headers["authorization"] == "Bearer fresh-token" {
                        (StatusCode::OK, "ok").into_response()
                    } else {
                        (StatusCode::UNAUTHORIZED, "expired").into_response()
                    }
                }),
            )
    }

    async fn seed(harness: &Harness, expires_in: Duration, refresh: Option<&str>) -> Integration {
        harness
            .store
            .upsert_tokens(
                "user-1",
                "google",
                &TokenUpdate {
                    access_token: "old-token".to_string(),
                    refresh_token: refresh.map(str::to_string),
                    expires_at: Some(Utc::now() + expires_in),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_token_is_used_as_is() {
        let harness = Harness::new("http://127.0.0.1:9").await;
        let integration = seed(&harness, Duration::hours(1), None).await;

        let token = ensure_fresh(&harness.context(), &integration).await.unwrap();
        assert_eq!(token, "old-token");
    }

    #[tokio::test]
    async fn test_stale_token_refreshes_and_keeps_refresh_token() {
        let base = spawn_upstream(token_router()).await;
        let harness = Harness::new(&base).await;
        let integration = seed(&harness, Duration::seconds(30), Some("stored-refresh")).await;

        let token = ensure_fresh(&harness.context(), &integration).await.unwrap();
        assert_eq!(token, "fresh-token");

        let stored = harness.store.get("user-1", "google").await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh-token"));
        assert_eq!(stored.refresh_token.as_deref(), Some("stored-refresh"));
        assert!(!is_stale(&stored));
    }

    #[tokio::test]
    async fn test_stale_without_refresh_token_asks_to_reconnect() {
        let harness = Harness::new("http://127.0.0.1:9").await;
        let integration = seed(&harness, Duration::seconds(-10), None).await;

        let err = ensure_fresh(&harness.context(), &integration).await.unwrap_err();
        assert_eq!(err.to_string(), GMAIL_RECONNECT);
    }

    #[tokio::test]
    async fn test_unauthorized_call_retries_after_refresh() {
        let base = spawn_upstream(token_router()).await;
        let harness = Harness::new(&base).await;
        let integration = seed(&harness, Duration::hours(1), Some("stored-refresh")).await;
        let ctx = harness.context();

        let result = call_google_api("test", &ctx, &integration, "old-token", |token| {
            harness
                .http_client
                .get(format!("{}/protected", base))
                .bearer_auth(token)
        })
        .await
        .unwrap();

        assert_eq!(result.response.status().as_u16(), 200);
        assert_eq!(result.token, "fresh-token");
    }
}
