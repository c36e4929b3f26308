//! GitHub connector: profile and recently updated repositories.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchboard_auth_bridge::{AuthToken, Provider, USER_AGENT_VALUE};
use tracing::{error, info};

use crate::error::{Error, Result};

use super::{call_with_backoff, ConfigRequest, Connector, ConnectorContext, Feed, FeedKind};

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

pub struct GithubConnector;

#[async_trait]
impl Connector for GithubConnector {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    async fn client_config(
        &self,
        ctx: &ConnectorContext<'_>,
        request: &ConfigRequest<'_>,
    ) -> Result<serde_json::Value> {
        let config = ctx.provider_config(Provider::Github)?;
        let client_id = config
            .client_id()
            .ok_or_else(|| Error::MissingConfiguration("GitHub Client ID not configured".to_string()))?;

        let origin = request
            .origin
            .filter(|o| !o.is_empty())
            .ok_or_else(|| Error::InvalidRequest("Origin header is required".to_string()))?;
        let suffixes = &ctx.config.server.allowed_origin_suffixes;
        if !is_allowed_origin(origin, suffixes) {
            return Err(Error::InvalidRequest(format!(
                "Invalid origin: {}. Must be from {} domain.",
                origin,
                allowed_origin_list(suffixes)
            )));
        }

        let redirect_uri = format!("{}/oauth-callback.html", origin.trim_end_matches('/'));
        let authorize_config = config
            .authorize_config(&redirect_uri)
            .ok_or_else(|| Error::MissingConfiguration("GitHub Client ID not configured".to_string()))?;
        let (authorize_url, _) = ctx.bridge.authorize_url(
            &authorize_config,
            &config.scopes,
            &config.authorize_params(),
            Provider::Github.as_str(),
        )?;

        Ok(json!({
            "clientId": client_id,
            "redirectUri": redirect_uri,
            "authorizeUrl": authorize_url,
            "message": "GitHub config retrieved successfully",
        }))
    }

    async fn identify(
        &self,
        ctx: &ConnectorContext<'_>,
        token: &AuthToken,
    ) -> Result<Option<serde_json::Value>> {
        let url = ctx.provider_config(Provider::Github)?.api_url("/user");
        let response = call_with_backoff("github", ctx.backoff(), || {
            github_get(ctx.http_client, &url, &token.access_token)
        })
        .await?;

        if !response.status().is_success() {
            error!("GitHub user lookup failed: {}", response.status());
            return Err(Error::upstream("Failed to fetch GitHub user information"));
        }

        let user: GithubUser = response
            .json()
            .await
            .map_err(|_| Error::upstream("Failed to fetch GitHub user information"))?;
        info!("connected GitHub account {}", user.login);
        Ok(Some(json!({
            "login": user.login,
            "avatar_url": user.avatar_url,
        })))
    }

    async fn fetch(&self, ctx: &ConnectorContext<'_>, user_id: &str, _kind: FeedKind) -> Result<Feed> {
        let integration = ctx
            .connected_integration(user_id, Provider::Github, "GitHub")
            .await?;
        let token = integration.access_token.unwrap_or_default();
        let config = ctx.provider_config(Provider::Github)?;

        let user_url = config.api_url("/user");
        let user: GithubUser = get_json(ctx, &user_url, &token).await?;

        let repos_url = config.api_url("/user/repos?sort=updated&per_page=5");
        let repositories: Vec<GithubRepository> = get_json(ctx, &repos_url, &token).await?;

        info!(
            "fetched GitHub data for {}: {} repositories",
            user.login,
            repositories.len()
        );
        Ok(Feed::Github(GithubFeed { user, repositories }))
    }
}

fn github_get(client: &reqwest::Client, url: &str, token: &str) -> reqwest::RequestBuilder {
    client
        .get(url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
        .header(reqwest::header::USER_AGENT, USER_AGENT_VALUE)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    ctx: &ConnectorContext<'_>,
    url: &str,
    token: &str,
) -> Result<T> {
    let response = call_with_backoff("github", ctx.backoff(), || {
        github_get(ctx.http_client, url, token)
    })
    .await?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        error!("GitHub API error {}: {}", status, body);
        return Err(Error::upstream(format!("GitHub API error: {}", body)));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Hostname is `localhost` or ends with one of `suffixes`.
pub fn is_allowed_origin(origin: &str, suffixes: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(origin) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    host == "localhost" || suffixes.iter().any(|suffix| host.ends_with(suffix.as_str()))
}

/// "localhost, a, or b" for the origin rejection message.
fn allowed_origin_list(suffixes: &[String]) -> String {
    let mut names = vec!["localhost".to_string()];
    names.extend(suffixes.iter().cloned());
    match names.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{}, or {}", rest.join(", "), last),
        _ => names.join(""),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubFeed {
    pub user: GithubUser,
    pub repositories: Vec<GithubRepository>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub public_repos: Option<u64>,
    #[serde(default)]
    pub followers: Option<u64>,
    #[serde(default)]
    pub following: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubRepository {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub updated_at: Option<String>,
}
