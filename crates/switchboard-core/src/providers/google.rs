//! Gmail connector: the ten most recent messages of the connected account.

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchboard_auth_bridge::{AuthToken, Provider};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::tokens::{call_google_api, ensure_fresh, GMAIL_RECONNECT};

use super::{ConfigRequest, Connector, ConnectorContext, Feed, FeedKind};

static BEARER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^bearer\s+").expect("valid regex"));

/// Access tokens shorter than this are rejected before calling Google.
const MIN_TOKEN_LEN: usize = 50;

pub struct GmailConnector;

#[async_trait]
impl Connector for GmailConnector {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn client_config(
        &self,
        ctx: &ConnectorContext<'_>,
        request: &ConfigRequest<'_>,
    ) -> Result<serde_json::Value> {
        let config = ctx.provider_config(Provider::Google)?;
        let client_id = match (config.client_id(), config.client_secret()) {
            (Some(id), Some(_)) => id,
            _ => {
                return Err(Error::MissingConfiguration(
                    "Missing Google OAuth configuration".to_string(),
                ))
            }
        };

        let origin = request
            .origin
            .filter(|o| !o.is_empty())
            .unwrap_or(&ctx.config.server.public_url);
        let redirect_uri = format!("{}/oauth/callback", origin.trim_end_matches('/'));

        let authorize_config = config.authorize_config(&redirect_uri).ok_or_else(|| {
            Error::MissingConfiguration("Missing Google OAuth configuration".to_string())
        })?;
        let (authorize_url, _) = ctx.bridge.authorize_url(
            &authorize_config,
            &config.scopes,
            &config.authorize_params(),
            Provider::Google.as_str(),
        )?;

        Ok(json!({
            "clientId": client_id,
            "scopes": config.scopes.join(" "),
            "redirectUri": redirect_uri,
            "authorizeUrl": authorize_url,
        }))
    }

    async fn identify(
        &self,
        ctx: &ConnectorContext<'_>,
        token: &AuthToken,
    ) -> Result<Option<serde_json::Value>> {
        let url = ctx.provider_config(Provider::Google)?.api_url("/oauth2/v2/userinfo");
        let response = ctx
            .http_client
            .get(&url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            error!("Google userinfo rejected new token: {}", response.status());
            return Err(Error::upstream("Invalid access token received from Google"));
        }
        Ok(None)
    }

    async fn fetch(&self, ctx: &ConnectorContext<'_>, user_id: &str, _kind: FeedKind) -> Result<Feed> {
        let integration = ctx
            .connected_integration(user_id, Provider::Google, "Gmail")
            .await?;
        let config = ctx.provider_config(Provider::Google)?;

        let token = ensure_fresh(ctx, &integration).await?;
        let token = BEARER_PREFIX.replace(token.trim(), "").into_owned();
        info!("using Gmail token (length {})", token.len());
        if token.len() < MIN_TOKEN_LEN {
            return Err(Error::upstream("Token appears invalid - too short"));
        }

        let userinfo_url = config.api_url("/oauth2/v3/userinfo");
        let validated = call_google_api("gmail", ctx, &integration, &token, |token| {
            ctx.http_client.get(&userinfo_url).bearer_auth(token)
        })
        .await?;
        let token = validated.token;
        if !validated.response.status().is_success() {
            let body = validated.response.text().await.unwrap_or_default();
            error!("Gmail token validation failed: {}", body);
            return Err(Error::upstream(format!("Token validation failed: {}", body)));
        }

        let list_url = config.data_api_url("/gmail/v1/users/me/messages?maxResults=10");
        let listed = call_google_api("gmail", ctx, &integration, &token, |token| {
            ctx.http_client.get(&list_url).bearer_auth(token)
        })
        .await?;
        let token = listed.token;
        let status = listed.response.status();
        let body = listed.response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!("Gmail list failed with {}: {}", status, body);
            return Err(Error::upstream(list_failure_message(status.as_u16(), &body)));
        }

        let list: GmailListResponse = serde_json::from_str(&body)?;
        let refs = list.messages.unwrap_or_default();
        info!("Gmail returned {} message ids", refs.len());

        let details = join_all(refs.iter().map(|message_ref| {
            let url = config.data_api_url(&format!("/gmail/v1/users/me/messages/{}", message_ref.id));
            let token = token.as_str();
            async move {
                let response = match ctx.http_client.get(&url).bearer_auth(token).send().await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("Gmail message {} request failed: {}", message_ref.id, err);
                        return None;
                    }
                };
                if !response.status().is_success() {
                    warn!("Gmail message {} returned {}", message_ref.id, response.status());
                    return None;
                }
                match response.json::<RawGmailMessage>().await {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!("Gmail message {} unreadable: {}", message_ref.id, err);
                        None
                    }
                }
            }
        }))
        .await;

        let emails: Vec<GmailMessage> = details.into_iter().flatten().map(GmailMessage::from).collect();
        info!("fetched {} Gmail messages", emails.len());
        Ok(Feed::Gmail(GmailFeed { emails }))
    }
}

/// Map a failed list call onto the message shown in the dashboard. The error
/// code in the body wins over the HTTP status.
fn list_failure_message(status: u16, body: &str) -> String {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["code"].as_u64())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(status);
    match code {
        403 => "Access denied. Please ensure Gmail access is enabled for your Google account.".to_string(),
        401 => GMAIL_RECONNECT.to_string(),
        _ => "Failed to fetch Gmail messages".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailFeed {
    pub emails: Vec<GmailMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailMessage {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub date: Option<String>,
    pub snippet: Option<String>,
}

impl From<RawGmailMessage> for GmailMessage {
    fn from(raw: RawGmailMessage) -> Self {
        let headers = raw.payload.map(|p| p.headers).unwrap_or_default();
        let header = |name: &str| {
            headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        };
        Self {
            subject: header("subject").unwrap_or_else(|| "No Subject".to_string()),
            from: header("from").unwrap_or_else(|| "Unknown".to_string()),
            date: header("date"),
            id: raw.id,
            snippet: raw.snippet,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawGmailMessage {
    id: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}
