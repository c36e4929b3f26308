//! Slack connector. Messages are read through Merge.dev's ticketing API
//! rather than Slack's own, so the connection is a Merge linked account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_auth_bridge::Provider;
use tracing::{error, info};

use crate::error::{Error, Result};

use super::{call_with_backoff, ConfigRequest, Connector, ConnectorContext, Feed, FeedKind};

const MESSAGES_PATH: &str = "/api/ticketing/v1/messages";
const LINK_TOKEN_PATH: &str = "/api/integrations/slack/link-token";
const ACCOUNT_TOKEN_PATH: &str = "/api/integrations/account-token";

/// Sent to Merge when the caller's email is unknown; Merge replaces it.
const PLACEHOLDER_EMAIL: &str = "user@example.com";

pub struct SlackConnector;

#[async_trait]
impl Connector for SlackConnector {
    fn provider(&self) -> Provider {
        Provider::Slack
    }

    /// Link token for the Merge Link modal, returned as `{url}`.
    async fn client_config(
        &self,
        ctx: &ConnectorContext<'_>,
        request: &ConfigRequest<'_>,
    ) -> Result<Value> {
        let api_key = ctx
            .config
            .merge_api_key()
            .ok_or_else(|| Error::MissingConfiguration("Server configuration error".to_string()))?;

        let body = json!({
            "end_user_origin": request.origin.unwrap_or_default(),
            "end_user_email_address": request.user_email.unwrap_or(PLACEHOLDER_EMAIL),
            "categories": ["ticketing"],
            "integration": "slack",
        });
        let url = ctx.config.merge_url(LINK_TOKEN_PATH);
        let response = call_with_backoff("merge", ctx.backoff(), || {
            ctx.http_client.post(&url).bearer_auth(api_key).json(&body)
        })
        .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let data: Value = serde_json::from_str(&text).map_err(|_| {
            error!("Merge link-token reply was not JSON ({})", status);
            Error::BadGateway("Received invalid response from authentication service".to_string())
        })?;

        if !status.is_success() {
            let message = data["error"]
                .as_str()
                .unwrap_or("Failed to get Slack configuration from authentication service");
            return Err(Error::Rejected(message.to_string()));
        }

        let link_token = data["link_token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::BadGateway("No authentication URL received from service".to_string())
            })?;

        info!("issued Merge link token for Slack");
        Ok(json!({ "url": link_token }))
    }

    async fn fetch(&self, ctx: &ConnectorContext<'_>, user_id: &str, kind: FeedKind) -> Result<Feed> {
        match kind {
            FeedKind::SlackNotifications => fetch_notifications(ctx, user_id).await,
            _ => fetch_messages(ctx, user_id).await,
        }
    }
}

async fn fetch_messages(ctx: &ConnectorContext<'_>, user_id: &str) -> Result<Feed> {
    let integration = ctx
        .integration(user_id, Provider::Slack)
        .await?
        .ok_or_else(|| Error::NotConnected("No Slack integration found".to_string()))?;

    let account_token = integration
        .merge_account_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Unauthorized {
            message: "No account token found".to_string(),
            detail: Some("Please reconnect your Slack account".to_string()),
        })?;

    let api_key = ctx
        .config
        .merge_api_key()
        .ok_or_else(|| Error::MissingConfiguration("Missing Merge API configuration".to_string()))?;

    let url = ctx
        .config
        .merge_url(&format!("{}?include_deleted=false", MESSAGES_PATH));
    let response = call_with_backoff("merge", ctx.backoff(), || {
        ctx.http_client
            .get(&url)
            .bearer_auth(api_key)
            .header("X-Account-Token", &account_token)
    })
    .await?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("Merge.dev messages error: {}", body);
        return Err(Error::upstream("Failed to fetch messages from Merge.dev"));
    }

    let page: MergePage = response.json().await?;
    let messages: Vec<SlackMessage> = page
        .results
        .unwrap_or_default()
        .into_iter()
        .map(SlackMessage::from)
        .collect();

    info!("fetched {} Slack messages via Merge.dev", messages.len());
    Ok(Feed::SlackMessages(SlackMessagesFeed { messages }))
}

async fn fetch_notifications(ctx: &ConnectorContext<'_>, user_id: &str) -> Result<Feed> {
    let api_key = ctx
        .config
        .merge_api_key()
        .ok_or_else(|| Error::MissingConfiguration("Missing Merge API configuration".to_string()))?;

    // Scope to the caller's linked account when there is one.
    let account_token = ctx
        .integration(user_id, Provider::Slack)
        .await?
        .and_then(|i| i.merge_account_token)
        .filter(|t| !t.is_empty());

    let url = ctx.config.merge_url(MESSAGES_PATH);
    let response = call_with_backoff("merge", ctx.backoff(), || {
        let request = ctx
            .http_client
            .get(&url)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "application/json");
        match &account_token {
            Some(token) => request.header("X-Account-Token", token),
            None => request,
        }
    })
    .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("Merge API error response: {}", body);
        return Err(Error::upstream(format!(
            "Merge API error: {} - {}",
            status.as_u16(),
            body
        )));
    }

    let data: Value = response.json().await?;
    let results = data["results"]
        .as_array()
        .ok_or_else(|| Error::upstream("Invalid response format from Merge API"))?;

    let drafts: Vec<SlackNotification> = results
        .iter()
        .filter(|msg| msg.is_object() && !msg["is_bot_message"].as_bool().unwrap_or(false))
        .map(SlackNotification::from_merge)
        .collect();
    info!("processing {} Slack notifications", drafts.len());

    let notifications = join_all(drafts.into_iter().map(|mut notification| async move {
        let analysis = ctx.analyzer.analyze(&notification.message).await;
        notification.priority = analysis.urgency;
        notification.sentiment = analysis.sentiment;
        notification.topic = analysis.topic;
        notification
    }))
    .await;

    Ok(Feed::SlackNotifications(SlackNotificationsFeed { notifications }))
}

/// Linked Merge account returned for a Merge Link public token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAccount {
    pub account_token: String,
    pub account_id: Option<String>,
}

/// Exchange a Merge Link public token for the linked account's token.
pub async fn exchange_public_token(ctx: &ConnectorContext<'_>, public_token: &str) -> Result<MergeAccount> {
    let public_token = public_token.trim();
    if public_token.is_empty() {
        return Err(Error::InvalidRequest("No public token provided".to_string()));
    }
    let api_key = ctx
        .config
        .merge_api_key()
        .ok_or_else(|| Error::MissingConfiguration("Missing Merge API configuration".to_string()))?;

    let url = ctx
        .config
        .merge_url(&format!("{}/{}", ACCOUNT_TOKEN_PATH, public_token));
    let response = call_with_backoff("merge", ctx.backoff(), || {
        ctx.http_client.get(&url).bearer_auth(api_key)
    })
    .await?;

    if !response.status().is_success() {
        error!("Merge account-token exchange failed: {}", response.status());
        return Err(Error::BadGateway("Failed to link Slack account via Merge.dev".to_string()));
    }

    let reply: AccountTokenReply = response
        .json()
        .await
        .map_err(|_| Error::BadGateway("Received invalid response from authentication service".to_string()))?;
    let account_token = reply
        .account_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::BadGateway("No account token received from Merge.dev".to_string()))?;

    Ok(MergeAccount {
        account_token,
        account_id: reply.id.or_else(|| reply.integration.and_then(|i| i.slug)),
    })
}

#[derive(Debug, Deserialize)]
struct AccountTokenReply {
    account_token: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    integration: Option<AccountIntegration>,
}

#[derive(Debug, Deserialize)]
struct AccountIntegration {
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MergePage {
    results: Option<Vec<MergeMessage>>,
}

#[derive(Debug, Deserialize)]
struct MergeMessage {
    remote_id: Option<String>,
    body: Option<String>,
    sender_name: Option<String>,
    created_at: Option<String>,
    channel_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackMessagesFeed {
    pub messages: Vec<SlackMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackMessage {
    pub id: Option<String>,
    pub text: Option<String>,
    pub user: Option<String>,
    pub timestamp: Option<String>,
    pub channel: String,
}

impl From<MergeMessage> for SlackMessage {
    fn from(msg: MergeMessage) -> Self {
        Self {
            id: msg.remote_id,
            text: msg.body,
            user: msg.sender_name,
            timestamp: msg.created_at,
            channel: msg
                .channel_name
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "Unknown Channel".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackNotificationsFeed {
    pub notifications: Vec<SlackNotification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackNotification {
    pub priority: String,
    pub sender: String,
    pub message: String,
    pub channel: String,
    pub time: String,
    pub sentiment: String,
    pub topic: String,
}

impl SlackNotification {
    fn from_merge(msg: &Value) -> Self {
        let text = |key: &str| msg[key].as_str().filter(|s| !s.is_empty()).map(str::to_string);
        let time = text("timestamp")
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Self {
            priority: "Low".to_string(),
            sender: text("sender_name").unwrap_or_else(|| "Unknown".to_string()),
            message: text("message_content").unwrap_or_default(),
            channel: text("channel_name").unwrap_or_else(|| "General".to_string()),
            time: time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            sentiment: "Neutral".to_string(),
            topic: "Pending analysis".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{spawn_upstream, Harness};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::analysis::MessageAnalyzer;

    #[tokio::test]
    async fn test_messages_require_integration_then_account_token() {
        let mut harness = Harness::new("http://127.0.0.1:9").await;
        harness.config.merge.api_key = Some("merge-key".to_string());

        let err = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackMessages)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert_eq!(err.to_string(), "No Slack integration found");

        harness
            .store
            .set_webhook_url("user-1", "slack", "https://hooks.example.com/x")
            .await
            .unwrap();
        let err = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackMessages)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No account token found");
        assert_eq!(err.detail(), Some("Please reconnect your Slack account"));
    }

    #[tokio::test]
    async fn test_messages_send_api_key_and_account_token() {
        let router = Router::new().route(
            MESSAGES_PATH,
            get(|headers: HeaderMap| async move {
                assert_eq!(headers["authorization"], "Bearer merge-key");
                assert_eq!(headers["x-account-token"], "acct-token");
                Json(serde_json::json!({
                    "results": [
                        { "remote_id": "r1", "body": "hi", "sender_name": "ada", "created_at": "2024-01-01T00:00:00Z", "channel_name": "eng" },
                        { "remote_id": "r2", "body": "yo", "sender_name": "bob" }
                    ]
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());
        harness
            .store
            .set_merge_account("user-1", "slack", "acct-token", Some("acct-1"))
            .await
            .unwrap();

        let Feed::SlackMessages(feed) = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackMessages)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };
        assert_eq!(feed.messages.len(), 2);
        assert_eq!(feed.messages[0].channel, "eng");
        assert_eq!(feed.messages[1].channel, "Unknown Channel");
        assert_eq!(feed.messages[1].user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_notifications_skip_bots_and_default_fields() {
        let router = Router::new().route(
            MESSAGES_PATH,
            get(|| async {
                Json(serde_json::json!({
                    "results": [
                        { "sender_name": "ada", "message_content": "deploy failed", "timestamp": "2024-03-01T12:00:00Z", "channel_name": "ops" },
                        { "sender_name": "bot", "message_content": "beep", "is_bot_message": true },
                        { "message_content": "" },
                        null
                    ]
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());

        let Feed::SlackNotifications(feed) = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackNotifications)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };

        assert_eq!(feed.notifications.len(), 2);
        let first = &feed.notifications[0];
        assert_eq!(first.sender, "ada");
        assert_eq!(first.channel, "ops");
        assert_eq!(first.time, "2024-03-01T12:00:00.000Z");
        // No analysis key configured in the harness.
        assert_eq!(first.priority, "Low");
        assert_eq!(first.sentiment, "Neutral");
        assert_eq!(first.topic, "No analysis");

        let second = &feed.notifications[1];
        assert_eq!(second.sender, "Unknown");
        assert_eq!(second.channel, "General");
        assert_eq!(second.message, "");
    }

    #[tokio::test]
    async fn test_notifications_reject_non_array_results() {
        let router = Router::new().route(
            MESSAGES_PATH,
            get(|| async { Json(serde_json::json!({ "results": "nope" })) }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());

        let err = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackNotifications)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid response format from Merge API");
    }

    #[tokio::test]
    async fn test_notifications_need_merge_key() {
        let harness = Harness::new("http://127.0.0.1:9").await;
        let err = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackNotifications)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing Merge API configuration");
    }

    #[tokio::test]
    async fn test_link_token_outcomes() {
        let router = Router::new().route(
            LINK_TOKEN_PATH,
            post(|Json(body): Json<Value>| async move {
                match body["end_user_origin"].as_str() {
                    Some("https://ok.example.com") => {
                        assert_eq!(body["end_user_email_address"], "a@example.com");
                        assert_eq!(body["categories"][0], "ticketing");
                        Json(serde_json::json!({ "link_token": "lt-123" })).into_response()
                    }
                    Some("https://bad.example.com") => (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({ "error": "invalid origin" })),
                    )
                        .into_response(),
                    Some("https://empty.example.com") => Json(serde_json::json!({})).into_response(),
                    _ => (StatusCode::OK, "<html>").into_response(),
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());
        let ctx = harness.context();
        fn request(origin: &str) -> ConfigRequest<'_> {
            ConfigRequest {
                origin: Some(origin),
                user_email: Some("a@example.com"),
            }
        }

        let ok = SlackConnector
            .client_config(&ctx, &request("https://ok.example.com"))
            .await
            .unwrap();
        assert_eq!(ok, serde_json::json!({ "url": "lt-123" }));

        let err = SlackConnector
            .client_config(&ctx, &request("https://bad.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(ref m) if m == "invalid origin"));

        let err = SlackConnector
            .client_config(&ctx, &request("https://empty.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadGateway(_)));

        let err = SlackConnector
            .client_config(&ctx, &request("https://html.example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Received invalid response from authentication service");
    }

    #[tokio::test]
    async fn test_exchange_public_token() {
        let router = Router::new().route(
            "/api/integrations/account-token/{token}",
            get(|axum::extract::Path(token): axum::extract::Path<String>| async move {
                assert_eq!(token, "pub-1");
                Json(serde_json::json!({
                    "account_token": "acct-token",
                    "integration": { "slug": "slack" }
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());

        let account = exchange_public_token(&harness.context(), "pub-1").await.unwrap();
        assert_eq!(account.account_token, "acct-token");
        assert_eq!(account.account_id.as_deref(), Some("slack"));

        let err = exchange_public_token(&harness.context(), " ").await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_messages_retry_after_rate_limit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            MESSAGES_PATH,
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "0")], "slow down")
                            .into_response();
                    }
                    Json(serde_json::json!({
                        "results": [{ "remote_id": "r1", "body": "hi", "channel_name": "eng" }]
                    }))
                    .into_response()
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());
        harness
            .store
            .set_merge_account("user-1", "slack", "acct-token", None)
            .await
            .unwrap();

        let Feed::SlackMessages(feed) = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackMessages)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(feed.messages.len(), 1);
        assert_eq!(feed.messages[0].channel, "eng");
    }

    #[tokio::test]
    async fn test_notifications_are_classified() {
        let router = Router::new()
            .route(
                MESSAGES_PATH,
                get(|| async {
                    Json(serde_json::json!({
                        "results": [
                            { "sender_name": "ada", "message_content": "prod is down", "channel_name": "ops" },
                            { "sender_name": "bob", "message_content": "lunch?", "channel_name": "random" },
                            { "sender_name": "eve", "message_content": "unparseable", "channel_name": "random" }
                        ]
                    }))
                }),
            )
            .route(
                "/v1/chat/completions",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers["authorization"], "Bearer analysis-key");
                    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
                    let content = if prompt.contains("prod is down") {
                        r#"{"urgency":"Critical","sentiment":"Negative","topic":"Production outage"}"#
                    } else if prompt.contains("lunch?") {
                        r#"{"urgency":"Low","sentiment":"Positive","topic":"Lunch plans"}"#
                    } else {
                        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                    };
                    Json(serde_json::json!({
                        "choices": [{ "message": { "content": content } }]
                    }))
                    .into_response()
                }),
            );
        let base = spawn_upstream(router).await;
        let mut harness = Harness::new(&base).await;
        harness.config.merge.api_key = Some("merge-key".to_string());
        harness.config.analysis.api_key = Some("analysis-key".to_string());
        harness.analyzer = MessageAnalyzer::new(harness.http_client.clone(), &harness.config.analysis);

        let Feed::SlackNotifications(feed) = SlackConnector
            .fetch(&harness.context(), "user-1", FeedKind::SlackNotifications)
            .await
            .unwrap()
        else {
            panic!("unexpected feed");
        };

        assert_eq!(feed.notifications.len(), 3);
        let outage = &feed.notifications[0];
        assert_eq!(outage.priority, "Critical");
        assert_eq!(outage.sentiment, "Negative");
        assert_eq!(outage.topic, "Production outage");

        assert_eq!(feed.notifications[1].sentiment, "Positive");

        let failed = &feed.notifications[2];
        assert_eq!(failed.priority, "Low");
        assert_eq!(failed.sentiment, "Neutral");
        assert_eq!(failed.topic, "Analysis failed");
    }
}
