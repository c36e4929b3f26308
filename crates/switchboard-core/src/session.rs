//! Dashboard session verification.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::providers::config::{join_url, SessionConfig};

/// The signed-in dashboard user behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, access_token: &str) -> Result<SessionUser>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let value = header
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::unauthorized("No authorization header"))?;

    // A header that carries only the scheme has been trimmed down to the word.
    if value.eq_ignore_ascii_case("bearer") {
        return Err(Error::unauthorized("No authorization header"));
    }
    let token = match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    };
    if token.is_empty() {
        return Err(Error::unauthorized("No authorization header"));
    }
    Ok(token)
}

/// Verifies sessions against the auth service's `GET /auth/v1/user`.
pub struct RemoteSessionVerifier {
    http_client: reqwest::Client,
    user_url: String,
    api_key: Option<String>,
}

impl RemoteSessionVerifier {
    pub fn new(http_client: reqwest::Client, auth_url: &str, api_key: Option<String>) -> Self {
        Self {
            http_client,
            user_url: join_url(auth_url, "/auth/v1/user"),
            api_key,
        }
    }

    pub fn from_config(http_client: reqwest::Client, config: &SessionConfig) -> Option<Self> {
        let auth_url = config.auth_url.as_deref().filter(|u| !u.is_empty())?;
        Some(Self::new(http_client, auth_url, config.api_key.clone()))
    }
}

#[async_trait]
impl SessionVerifier for RemoteSessionVerifier {
    async fn verify(&self, access_token: &str) -> Result<SessionUser> {
        let mut request = self.http_client.get(&self.user_url).bearer_auth(access_token);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!("session rejected by auth service: {}", response.status());
            return Err(Error::unauthorized("Invalid session"));
        }

        response
            .json::<SessionUser>()
            .await
            .map_err(|_| Error::unauthorized("Invalid session"))
    }
}

/// Fixed token-to-user table, for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionVerifier {
    sessions: HashMap<String, SessionUser>,
}

impl StaticSessionVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, token: &str, user: SessionUser) -> Self {
        self.sessions.insert(token.to_string(), user);
        self
    }
}

#[async_trait]
impl SessionVerifier for StaticSessionVerifier {
    async fn verify(&self, access_token: &str) -> Result<SessionUser> {
        self.sessions
            .get(access_token)
            .cloned()
            .ok_or_else(|| Error::unauthorized("Invalid session"))
    }
}
