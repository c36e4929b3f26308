//! Figma connector: recent files with their comments and thumbnails.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchboard_auth_bridge::Provider;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

use super::{call_with_backoff, ConfigRequest, Connector, ConnectorContext, Feed, FeedKind};

/// Files past this count are skipped to stay under Figma's rate limits.
const MAX_FILES: usize = 5;

pub struct FigmaConnector;

#[async_trait]
impl Connector for FigmaConnector {
    fn provider(&self) -> Provider {
        Provider::Figma
    }

    async fn client_config(
        &self,
        ctx: &ConnectorContext<'_>,
        request: &ConfigRequest<'_>,
    ) -> Result<serde_json::Value> {
        let config = ctx.provider_config(Provider::Figma)?;
        let client_id = config.client_id().ok_or_else(|| {
            Error::MissingConfiguration("Figma credentials not properly configured".to_string())
        })?;

        let origin = request
            .origin
            .filter(|o| !o.is_empty())
            .unwrap_or(&ctx.config.server.public_url);
        let redirect_uri = format!("{}/oauth/callback", origin.trim_end_matches('/'));

        let authorize_config = config.authorize_config(&redirect_uri).ok_or_else(|| {
            Error::MissingConfiguration("Figma credentials not properly configured".to_string())
        })?;
        let mut params = config.authorize_params();
        params.push(("response_type".to_string(), "code".to_string()));
        let (authorize_url, _) = ctx.bridge.authorize_url(
            &authorize_config,
            &config.scopes,
            &params,
            Provider::Figma.as_str(),
        )?;

        Ok(json!({
            "clientId": client_id,
            "scopes": config.scopes.join(","),
            "redirectUri": redirect_uri,
            "authorizeUrl": authorize_url,
        }))
    }

    async fn fetch(&self, ctx: &ConnectorContext<'_>, user_id: &str, _kind: FeedKind) -> Result<Feed> {
        let integration = ctx
            .connected_integration(user_id, Provider::Figma, "Figma")
            .await?;
        let token = integration.access_token.unwrap_or_default();
        let config = ctx.provider_config(Provider::Figma)?;

        let files_url = config.api_url("/v1/me/files");
        let response = call_with_backoff("figma", ctx.backoff(), || {
            ctx.http_client.get(&files_url).bearer_auth(&token)
        })
        .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("failed to fetch Figma files: {}", body);
            return Err(Error::upstream("Failed to fetch Figma files"));
        }

        let listing: FilesResponse = response.json().await?;
        let files = listing.files.unwrap_or_default();
        info!("found {} Figma files", files.len());

        let files = join_all(files.into_iter().take(MAX_FILES).map(|file| {
            let token = token.as_str();
            async move {
                let (comments, thumbnail) = futures::join!(
                    fetch_comments(ctx, config.api_url(&format!("/v1/files/{}/comments", file.key)), token, &file.key),
                    fetch_thumbnail(ctx, config.api_url(&format!("/v1/files/{}/thumbnails", file.key)), token, &file.key),
                );
                FigmaFile {
                    thumbnail_url: thumbnail.or(file.thumbnail_url),
                    key: file.key,
                    name: file.name,
                    last_modified: file.last_modified,
                    comments,
                }
            }
        }))
        .await;

        Ok(Feed::Figma(FigmaFeed { files }))
    }
}

async fn fetch_comments(
    ctx: &ConnectorContext<'_>,
    url: String,
    token: &str,
    key: &str,
) -> Vec<FigmaComment> {
    let response = match call_with_backoff("figma", ctx.backoff(), || {
        ctx.http_client.get(&url).bearer_auth(token)
    })
    .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!("comments for Figma file {} returned {}", key, response.status());
            return Vec::new();
        }
        Err(err) => {
            warn!("comments for Figma file {} failed: {}", key, err);
            return Vec::new();
        }
    };

    match response.json::<CommentsResponse>().await {
        Ok(body) => body.comments.unwrap_or_default(),
        Err(err) => {
            warn!("comments for Figma file {} unreadable: {}", key, err);
            Vec::new()
        }
    }
}

async fn fetch_thumbnail(
    ctx: &ConnectorContext<'_>,
    url: String,
    token: &str,
    key: &str,
) -> Option<String> {
    let response = match call_with_backoff("figma", ctx.backoff(), || {
        ctx.http_client.get(&url).bearer_auth(token)
    })
    .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!("thumbnail for Figma file {} returned {}", key, response.status());
            return None;
        }
        Err(err) => {
            warn!("thumbnail for Figma file {} failed: {}", key, err);
            return None;
        }
    };
    let mut body: ThumbnailsResponse = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            warn!("thumbnail for Figma file {} unreadable: {}", key, err);
            return None;
        }
    };
    body.images.as_mut().and_then(|images| images.remove(key))
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    files: Option<Vec<RawFigmaFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFigmaFile {
    key: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    comments: Option<Vec<FigmaComment>>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailsResponse {
    images: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigmaFeed {
    pub files: Vec<FigmaFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigmaFile {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub last_modified: Option<String>,
    pub comments: Vec<FigmaComment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigmaComment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub client_meta: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{spawn_upstream, Harness};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use switchboard_store::TokenUpdate;

    async fn harness_with_token(base: &str) -> Harness {
        let harness = Harness::new(base).await;
        harness
            .store
            .upsert_tokens(
                "user-1",
                "figma",
                &TokenUpdate {
                    access_token: "figma-token".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        harness
    }

    fn figma_router() -> Router {
        Router::new()
            .route(
                "/v1/me/files",
                get(|| async {
                    let files: Vec<_> = (0..7)
                        .map(|i| {
                            serde_json::json!({
                                "key": format!("f{}", i),
                                "name": format!("File {}", i),
                                "last_modified": "2024-02-01T00:00:00Z",
                                "thumbnail_url": "https://old.example.com/thumb.png"
                            })
                        })
                        .collect();
                    Json(serde_json::json!({ "files": files }))
                }),
            )
            .route(
                "/v1/files/{key}/comments",
                get(|Path(key): Path<String>| async move {
                    if key == "f1" {
                        return (StatusCode::FORBIDDEN, "no").into_response();
                    }
                    Json(serde_json::json!({
                        "comments": [{ "id": format!("c-{}", key), "message": "nice", "file_key": key }]
                    }))
                    .into_response()
                }),
            )
            .route(
                "/v1/files/{key}/thumbnails",
                get(|Path(key): Path<String>| async move {
                    if key == "f2" {
                        return (StatusCode::NOT_FOUND, "no").into_response();
                    }
                    let mut images = serde_json::Map::new();
                    images.insert(key.clone(), format!("https://cdn.example.com/{}.png", key).into());
                    Json(serde_json::json!({ "images": images })).into_response()
                }),
            )
    }

    #[tokio::test]
    async fn test_fetch_limits_files_and_tolerates_partial_failures() {
        let base = spawn_upstream(figma_router()).await;
        let harness = harness_with_token(&base).await;

        let Feed::Figma(feed) = FigmaConnector
            .fetch(&harness.context(), "user-1", FeedKind::FigmaFiles)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };

        assert_eq!(feed.files.len(), 5);
        assert_eq!(feed.files[0].comments.len(), 1);
        assert_eq!(
            feed.files[0].thumbnail_url.as_deref(),
            Some("https://cdn.example.com/f0.png")
        );
        // Comment failure yields an empty list.
        assert!(feed.files[1].comments.is_empty());
        // Thumbnail failure keeps the listing's thumbnail.
        assert_eq!(
            feed.files[2].thumbnail_url.as_deref(),
            Some("https://old.example.com/thumb.png")
        );
    }

    #[tokio::test]
    async fn test_fetch_without_token_fails_before_upstream() {
        let harness = Harness::new("http://127.0.0.1:9").await;
        harness
            .store
            .set_webhook_url("user-1", "figma", "https://hooks.example.com/1")
            .await
            .unwrap();

        let err = FigmaConnector
            .fetch(&harness.context(), "user-1", FeedKind::FigmaFiles)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No Figma integration found");
    }

    #[tokio::test]
    async fn test_files_failure() {
        let router = Router::new().route(
            "/v1/me/files",
            get(|| async { (StatusCode::FORBIDDEN, "Invalid token") }),
        );
        let base = spawn_upstream(router).await;
        let harness = Harness::new(&base).await;
        harness
            .store
            .upsert_tokens(
                "user-1",
                "figma",
                &TokenUpdate {
                    access_token: "bad".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = FigmaConnector
            .fetch(&harness.context(), "user-1", FeedKind::FigmaFiles)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to fetch Figma files");
    }

    #[tokio::test]
    async fn test_client_config_requires_client_id() {
        let mut harness = Harness::new("http://127.0.0.1:9").await;
        let ctx_config = harness.context();
        let config = FigmaConnector
            .client_config(
                &ctx_config,
                &ConfigRequest {
                    origin: Some("https://dash.example.com"),
                    user_email: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(config["scopes"], "files:read");
        assert_eq!(config["redirectUri"], "https://dash.example.com/oauth/callback");

        if let Some(figma) = harness.config.provider_mut(Provider::Figma) {
            figma.client_id = None;
        }
        let err = FigmaConnector
            .client_config(&harness.context(), &ConfigRequest { origin: None, user_email: None })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Figma credentials not properly configured");
    }

    #[tokio::test]
    async fn test_thumbnail_retries_after_rate_limit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new()
            .route(
                "/v1/me/files",
                get(|| async { Json(serde_json::json!({ "files": [{ "key": "f0", "name": "Only" }] })) }),
            )
            .route(
                "/v1/files/{key}/comments",
                get(|| async {
                    // A comment without an id must not hide its siblings.
                    Json(serde_json::json!({
                        "comments": [{ "message": "no id" }, { "id": "c1", "message": "ok" }]
                    }))
                }),
            )
            .route(
                "/v1/files/{key}/thumbnails",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            return (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "0")], "slow down")
                                .into_response();
                        }
                        Json(serde_json::json!({ "images": { "f0": "https://cdn.example.com/f0.png" } }))
                            .into_response()
                    }
                }),
            );
        let base = spawn_upstream(router).await;
        let harness = harness_with_token(&base).await;

        let Feed::Figma(feed) = FigmaConnector
            .fetch(&harness.context(), "user-1", FeedKind::FigmaFiles)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            feed.files[0].thumbnail_url.as_deref(),
            Some("https://cdn.example.com/f0.png")
        );
        assert_eq!(feed.files[0].comments.len(), 2);
        assert_eq!(feed.files[0].comments[1].id, "c1");
    }
}
