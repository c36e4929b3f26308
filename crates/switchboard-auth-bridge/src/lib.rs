use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};

use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// User agent sent to token endpoints. GitHub rejects requests without one.
pub const USER_AGENT_VALUE: &str = "switchboard";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Google,
    Slack,
    Figma,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Github,
        Provider::Google,
        Provider::Slack,
        Provider::Figma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Google => "google",
            Provider::Slack => "slack",
            Provider::Figma => "figma",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Github => "GitHub",
            Provider::Google => "Google",
            Provider::Slack => "Slack",
            Provider::Figma => "Figma",
        }
    }

    /// Lifetime assumed for access tokens when the token endpoint omits `expires_in`.
    fn default_token_lifetime(&self) -> Option<Duration> {
        match self {
            Provider::Figma => Some(Duration::hours(1)),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::Github),
            "google" | "gmail" => Ok(Provider::Google),
            "slack" => Ok(Provider::Slack),
            "figma" => Ok(Provider::Figma),
            other => Err(anyhow!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl AuthToken {
    /// True when the token expires within `skew` of `now`. Tokens without an
    /// expiry never go stale.
    pub fn is_stale_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at
            .map(|exp| exp <= now + skew)
            .unwrap_or(false)
    }
}

/// How the authorization code is posted to the token endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenRequestStyle {
    /// `application/x-www-form-urlencoded` body (Google, Slack).
    #[default]
    Form,
    /// JSON body (GitHub, Figma).
    Json,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
    pub style: TokenRequestStyle,
    /// Send `grant_type=authorization_code` with the code exchange.
    pub send_grant_type: bool,
}

#[derive(Debug, Clone)]
pub struct AuthBridge {
    http_client: Client,
}

impl Default for AuthBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBridge {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http_client }
    }

    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Build the provider authorize URL. `state` is echoed back on the
    /// callback so the dashboard can tell which provider answered.
    pub fn authorize_url(
        &self,
        config: &OAuthConfig,
        scopes: &[String],
        extra_params: &[(String, String)],
        state: &str,
    ) -> Result<(String, CsrfToken)> {
        let client = build_client(config)?;
        let mut req = client.authorize_url(|| CsrfToken::new(state.to_string()));
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        for (name, value) in extra_params {
            req = req.add_extra_param(name.as_str(), value.as_str());
        }
        let (url, csrf) = req.url();
        Ok((url.to_string(), csrf))
    }

    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        config: &OAuthConfig,
    ) -> Result<AuthToken> {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("code", code),
        ];
        if let Some(redirect_uri) = &config.redirect_uri {
            params.push(("redirect_uri", redirect_uri.as_str()));
        }
        if config.send_grant_type {
            params.push(("grant_type", "authorization_code"));
        }

        let request = self
            .http_client
            .post(&config.token_url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, USER_AGENT_VALUE);
        let request = match config.style {
            TokenRequestStyle::Form => request.form(&params),
            TokenRequestStyle::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                    .collect();
                request.json(&body)
            }
        };

        info!("sending {} token exchange request", provider.as_str());
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!("{} token response status: {}", provider.as_str(), status);

        let raw: RawTokenResponse = match serde_json::from_str(&body) {
            Ok(raw) => raw,
            Err(_) if provider == Provider::Google && !status.is_success() => {
                return Err(anyhow!("Failed to exchange code for access token: {}", body));
            }
            Err(err) => {
                warn!("{} token endpoint returned unreadable body: {}", provider.as_str(), err);
                return Err(anyhow!(
                    "{} token endpoint returned an unreadable response ({})",
                    provider.display_name(),
                    status
                ));
            }
        };

        if let Some(message) = exchange_failure(provider, status.is_success(), &raw, &body) {
            warn!(
                "{} token exchange failed: status={}, error={:?}",
                provider.as_str(),
                status,
                raw.error
            );
            return Err(anyhow!(message));
        }

        let access_token = match raw.access_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                return Err(anyhow!(match provider {
                    Provider::Github => "No access token received from GitHub",
                    Provider::Google => "No access token received from Google",
                    Provider::Slack | Provider::Figma =>
                        "Failed to exchange code for access token",
                }))
            }
        };

        let now = Utc::now();
        let expires_at = raw
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| expiry_after(now, secs))
            .or_else(|| {
                provider
                    .default_token_lifetime()
                    .and_then(|d| now.checked_add_signed(d))
            });

        info!("exchanged OAuth code for {} token", provider.as_str());
        Ok(AuthToken {
            provider,
            access_token,
            refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            scope: raw.scope,
            token_type: raw.token_type,
        })
    }

    pub async fn refresh_token(
        &self,
        provider: Provider,
        refresh_token: &str,
        config: &OAuthConfig,
    ) -> Result<AuthToken> {
        let client = build_client(config)?;
        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await?;

        let access_token = token.access_token().secret().to_string();
        let refresh_token = token.refresh_token().map(|t| t.secret().to_string());
        let expires_at = token
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .and_then(|d| Utc::now().checked_add_signed(d));
        let scope = token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        });
        let token_type = Some(token.token_type().as_ref().to_string());

        info!("refreshed {} access token", provider.as_str());
        Ok(AuthToken {
            provider,
            access_token,
            refresh_token,
            expires_at,
            scope,
            token_type,
        })
    }
}

/// `now + secs`, or `None` when an upstream lifetime is out of range.
fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    let expiry = Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
    if expiry.is_none() {
        warn!("ignoring out-of-range token lifetime: {}s", secs);
    }
    expiry
}

/// Token endpoint reply. Providers disagree on error signalling: GitHub
/// answers 200 with an `error` field, Slack sets `ok: false`.
#[derive(Debug, Default, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
    ok: Option<bool>,
    error: Option<String>,
    error_description: Option<String>,
}

fn exchange_failure(
    provider: Provider,
    success: bool,
    raw: &RawTokenResponse,
    body: &str,
) -> Option<String> {
    let failed = !success || raw.error.is_some() || raw.ok == Some(false);
    if !failed {
        return None;
    }

    let message = match provider {
        Provider::Github => match raw.error_description.as_ref().or(raw.error.as_ref()) {
            Some(reason) => format!("GitHub OAuth error: {}", reason),
            None => format!("GitHub OAuth error: {}", body),
        },
        Provider::Google => format!("Failed to exchange code for access token: {}", body),
        Provider::Slack => raw
            .error
            .clone()
            .unwrap_or_else(|| "Failed to exchange code for access token".to_string()),
        Provider::Figma => raw
            .error_description
            .clone()
            .unwrap_or_else(|| "Failed to exchange code for access token".to_string()),
    };
    Some(message)
}

/// Normalise a redirect URI the way providers compare them: parse, re-serialise
/// and drop one trailing slash.
pub fn clean_redirect_uri(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| anyhow!("Invalid redirect URI: {}", e))?;
    let serialized = parsed.to_string();
    Ok(serialized
        .strip_suffix('/')
        .map(str::to_string)
        .unwrap_or(serialized))
}

type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient> {
    let auth_url = AuthUrl::new(config.auth_url.clone())
        .map_err(|_| anyhow!("invalid auth_url"))?;
    let token_url = TokenUrl::new(config.token_url.clone())
        .map_err(|_| anyhow!("invalid token_url"))?;
    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_client_secret(ClientSecret::new(config.client_secret.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url);
    if let Some(redirect_uri) = &config.redirect_uri {
        client = client.set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);
    }
    Ok(client)
}
