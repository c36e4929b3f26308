//! Service configuration schema and loading.
//!
//! Configuration lives in `switchboard.toml` inside the data directory.
//! Anything the file leaves out falls back to the built-in defaults, and
//! secrets are normally supplied through the environment rather than the file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use switchboard_auth_bridge::{OAuthConfig, Provider, TokenRequestStyle};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Dashboard origin used when a request carries no `Origin` header.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Hostname suffixes accepted (besides `localhost`) when handing out the
    /// GitHub client configuration.
    #[serde(default = "default_origin_suffixes")]
    pub allowed_origin_suffixes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            allowed_origin_suffixes: default_origin_suffixes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_public_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_origin_suffixes() -> Vec<String> {
    vec!["lovable.app".to_string(), "lovableproject.com".to_string()]
}

/// Where dashboard session tokens are verified.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_merge_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            base_url: default_merge_url(),
            api_key: None,
        }
    }
}

fn default_merge_url() -> String {
    "https://api.merge.dev".to_string()
}

/// Chat-completions endpoint used to classify Slack notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_model")]
    pub model: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_analysis_url(),
            api_key: None,
            model: default_analysis_model(),
        }
    }
}

fn default_analysis_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_analysis_model() -> String {
    "gpt-3.5-turbo".to_string()
}

/// Retry schedule for rate-limited and failing upstream calls.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_server_error_retries")]
    pub max_server_error_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_rate_limit_retries: default_rate_limit_retries(),
            max_server_error_retries: default_server_error_retries(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_rate_limit_retries() -> u32 {
    8
}

fn default_server_error_retries() -> u32 {
    3
}

/// Configuration for a single OAuth provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub display_name: String,

    /// Environment variables the client credentials are read from.
    pub client_id_env: String,
    pub client_secret_env: String,

    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,

    pub auth_url: String,
    pub token_url: String,

    /// Base URL of the provider REST API.
    pub api_base_url: String,

    /// Second API host, used by Google for Gmail.
    #[serde(default)]
    pub data_api_url: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub token_style: TokenRequestStyle,

    #[serde(default)]
    pub send_grant_type: bool,

    /// Extra query parameters appended to the authorize URL.
    #[serde(default)]
    pub authorize_params: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|v| !v.is_empty())
    }

    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref().filter(|v| !v.is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id().is_some() && self.client_secret().is_some()
    }

    /// OAuth client settings for a code exchange or refresh. `None` when the
    /// client id or secret is missing.
    pub fn oauth_config(&self, redirect_uri: Option<String>) -> Option<OAuthConfig> {
        let client_id = self.client_id()?;
        let client_secret = self.client_secret()?;
        Some(OAuthConfig {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri,
            style: self.token_style,
            send_grant_type: self.send_grant_type,
        })
    }

    /// Settings for building an authorize URL, where only the client id is public.
    pub fn authorize_config(&self, redirect_uri: &str) -> Option<OAuthConfig> {
        let client_id = self.client_id()?;
        Some(OAuthConfig {
            client_id: client_id.to_string(),
            client_secret: self.client_secret().unwrap_or_default().to_string(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri: Some(redirect_uri.to_string()),
            style: self.token_style,
            send_grant_type: self.send_grant_type,
        })
    }

    pub fn authorize_params(&self) -> Vec<(String, String)> {
        self.authorize_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    pub fn data_api_url(&self, path: &str) -> String {
        join_url(
            self.data_api_url.as_deref().unwrap_or(&self.api_base_url),
            path,
        )
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl SwitchboardConfig {
    /// Load configuration from a TOML file. A missing file yields the defaults;
    /// providers named in the file replace the built-in entry of the same name.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: SwitchboardConfig = toml::from_str(contents)?;
        for (name, provider) in default_providers() {
            config.providers.entry(name).or_insert(provider);
        }
        Ok(config)
    }

    /// Overlay secrets and deployment settings from the process environment.
    pub fn with_env(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    /// Overlay values using `lookup` as the environment. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for provider in self.providers.values_mut() {
            if let Some(id) = get(&provider.client_id_env) {
                provider.client_id = Some(id);
            }
            if let Some(secret) = get(&provider.client_secret_env) {
                provider.client_secret = Some(secret);
            }
        }
        if let Some(key) = get("MERGE_API_KEY") {
            self.merge.api_key = Some(key);
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.analysis.api_key = Some(key);
        }
        if let Some(bind) = get("SWITCHBOARD_BIND") {
            self.server.bind = bind;
        }
        if let Some(url) = get("SWITCHBOARD_PUBLIC_URL") {
            self.server.public_url = url;
        }
        if let Some(url) = get("SWITCHBOARD_AUTH_URL") {
            self.session.auth_url = Some(url);
        }
        if let Some(key) = get("SWITCHBOARD_AUTH_API_KEY") {
            self.session.api_key = Some(key);
        }
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(provider.as_str())
    }

    pub fn provider_mut(&mut self, provider: Provider) -> Option<&mut ProviderConfig> {
        self.providers.get_mut(provider.as_str())
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.provider(provider).map(|c| c.enabled).unwrap_or(false)
    }

    pub fn merge_api_key(&self) -> Option<&str> {
        self.merge.api_key.as_deref().filter(|v| !v.is_empty())
    }

    pub fn merge_url(&self, path: &str) -> String {
        join_url(&self.merge.base_url, path)
    }
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            merge: MergeConfig::default(),
            analysis: AnalysisConfig::default(),
            backoff: BackoffPolicy::default(),
            providers: default_providers(),
        }
    }
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();

    providers.insert(
        "github".to_string(),
        ProviderConfig {
            enabled: true,
            display_name: "GitHub".to_string(),
            client_id_env: "GITHUB_CLIENT_ID".to_string(),
            client_secret_env: "GITHUB_CLIENT_SECRET".to_string(),
            client_id: None,
            client_secret: None,
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            data_api_url: None,
            scopes: vec!["repo".to_string(), "user".to_string()],
            token_style: TokenRequestStyle::Json,
            send_grant_type: false,
            authorize_params: BTreeMap::new(),
        },
    );

    let mut google_params = BTreeMap::new();
    google_params.insert("access_type".to_string(), "offline".to_string());
    google_params.insert("prompt".to_string(), "consent".to_string());
    providers.insert(
        "google".to_string(),
        ProviderConfig {
            enabled: true,
            display_name: "Gmail".to_string(),
            client_id_env: "GOOGLE_CLIENT_ID".to_string(),
            client_secret_env: "GOOGLE_CLIENT_SECRET".to_string(),
            client_id: None,
            client_secret: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base_url: "https://www.googleapis.com".to_string(),
            data_api_url: Some("https://gmail.googleapis.com".to_string()),
            scopes: vec![
                "https://www.googleapis.com/auth/gmail.readonly".to_string(),
                "https://mail.google.com/".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ],
            token_style: TokenRequestStyle::Form,
            send_grant_type: true,
            authorize_params: google_params,
        },
    );

    providers.insert(
        "slack".to_string(),
        ProviderConfig {
            enabled: true,
            display_name: "Slack".to_string(),
            client_id_env: "SLACK_CLIENT_ID".to_string(),
            client_secret_env: "SLACK_CLIENT_SECRET".to_string(),
            client_id: None,
            client_secret: None,
            auth_url: "https://slack.com/oauth/v2/authorize".to_string(),
            token_url: "https://slack.com/api/oauth.v2.access".to_string(),
            api_base_url: "https://slack.com/api".to_string(),
            data_api_url: None,
            scopes: vec!["channels:history".to_string(), "channels:read".to_string()],
            token_style: TokenRequestStyle::Form,
            send_grant_type: false,
            authorize_params: BTreeMap::new(),
        },
    );

    providers.insert(
        "figma".to_string(),
        ProviderConfig {
            enabled: true,
            display_name: "Figma".to_string(),
            client_id_env: "FIGMA_CLIENT_ID".to_string(),
            client_secret_env: "FIGMA_CLIENT_SECRET".to_string(),
            client_id: None,
            client_secret: None,
            auth_url: "https://www.figma.com/oauth".to_string(),
            token_url: "https://www.figma.com/api/oauth/token".to_string(),
            api_base_url: "https://api.figma.com".to_string(),
            data_api_url: None,
            scopes: vec!["files:read".to_string()],
            token_style: TokenRequestStyle::Json,
            send_grant_type: true,
            authorize_params: BTreeMap::new(),
        },
    );

    providers
}
