use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod analysis;
pub mod error;
pub mod providers;
pub mod session;
pub mod tokens;

pub use analysis::{Analysis, MessageAnalyzer};
pub use error::{Error, Result};
pub use providers::{
    ConfigRequest, Connector, ConnectorContext, Feed, FeedKind, ProviderRegistry,
    SwitchboardConfig,
};
pub use session::{
    bearer_token, RemoteSessionVerifier, SessionUser, SessionVerifier, StaticSessionVerifier,
};

pub use switchboard_auth_bridge::{clean_redirect_uri, AuthBridge, AuthToken, Provider};
pub use switchboard_store::{Integration, IntegrationStore, TokenUpdate};

#[derive(Debug, Clone)]
pub struct SwitchboardPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl SwitchboardPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("SWITCHBOARD_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(home) = std::env::var_os("HOME") {
            return Self::from_base(PathBuf::from(home).join(".switchboard"));
        }
        Self::from_base(PathBuf::from(".switchboard"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let db_path = base_dir.join("switchboard.db");
        let config_path = base_dir.join("switchboard.toml");
        Self {
            base_dir,
            db_path,
            config_path,
        }
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

/// Body of an OAuth exchange call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "redirectUri")]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
}

/// Connection state of one provider, without any secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationStatus {
    pub provider: String,
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub has_webhook: bool,
    pub has_merge_account: bool,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationStatus {
    pub fn from_integration(integration: &Integration, now: DateTime<Utc>) -> Self {
        let has_merge_account = integration
            .merge_account_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        Self {
            provider: integration.provider.clone(),
            connected: integration.has_access_token() || has_merge_account,
            expires_at: integration.expires_at,
            expired: integration.expires_at.map(|exp| exp <= now).unwrap_or(false),
            has_webhook: integration
                .webhook_url
                .as_deref()
                .is_some_and(|u| !u.is_empty()),
            has_merge_account,
            updated_at: integration.updated_at,
        }
    }
}

pub struct Core {
    pub config: SwitchboardConfig,
    pub store: IntegrationStore,
    pub registry: ProviderRegistry,
    bridge: AuthBridge,
    http_client: reqwest::Client,
    analyzer: MessageAnalyzer,
}

impl Core {
    pub async fn init(paths: &SwitchboardPaths) -> anyhow::Result<Self> {
        info!("Initializing Switchboard Core...");
        paths.ensure_dirs()?;
        let config = SwitchboardConfig::load(&paths.config_path)?.with_env();
        let store = IntegrationStore::new(&paths.db_path).await?;
        Ok(Self::with_parts(config, store))
    }

    pub fn with_parts(config: SwitchboardConfig, store: IntegrationStore) -> Self {
        let http_client = reqwest::Client::builder()
            .redirect(Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .user_agent(switchboard_auth_bridge::USER_AGENT_VALUE)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let analyzer = MessageAnalyzer::new(http_client.clone(), &config.analysis);
        let registry = ProviderRegistry::new(&config);
        let available: Vec<&str> = registry.list_available().iter().map(|p| p.as_str()).collect();
        info!("enabled providers: {}", available.join(", "));
        Self {
            config,
            store,
            registry,
            bridge: AuthBridge::new(),
            http_client,
            analyzer,
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn context(&self) -> ConnectorContext<'_> {
        ConnectorContext {
            http_client: &self.http_client,
            config: &self.config,
            store: &self.store,
            bridge: &self.bridge,
            analyzer: &self.analyzer,
        }
    }

    /// Public OAuth client settings for `provider`.
    pub async fn client_config(
        &self,
        provider: Provider,
        request: &ConfigRequest<'_>,
    ) -> Result<serde_json::Value> {
        let connector = self.registry.require(provider)?;
        connector.client_config(&self.context(), request).await
    }

    /// Exchange an authorization code and store the tokens on the caller's
    /// integration row.
    pub async fn connect(
        &self,
        user_id: &str,
        provider: Provider,
        request: &ExchangeRequest,
    ) -> Result<ExchangeResponse> {
        let code = request
            .code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidRequest("No authorization code provided".to_string()))?;

        let connector = self.registry.require(provider)?;
        let ctx = self.context();
        let provider_config = ctx.provider_config(provider)?;
        if !provider_config.has_credentials() {
            return Err(Error::MissingConfiguration(
                missing_credentials_message(provider).to_string(),
            ));
        }

        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(clean_redirect_uri)
            .transpose()
            .map_err(|err| Error::InvalidRequest(err.to_string()))?;
        let oauth = provider_config.oauth_config(redirect_uri).ok_or_else(|| {
            Error::MissingConfiguration(missing_credentials_message(provider).to_string())
        })?;

        let token = self
            .bridge
            .exchange_code(provider, code, &oauth)
            .await
            .map_err(|err| Error::Upstream(err.to_string()))?;
        let user = connector.identify(&ctx, &token).await?;

        let integration = self
            .store
            .upsert_tokens(
                user_id,
                provider.as_str(),
                &TokenUpdate {
                    access_token: token.access_token.clone(),
                    refresh_token: token.refresh_token.clone(),
                    expires_at: token.expires_at,
                },
            )
            .await?;
        info!(
            "connected {} for user {} (integration {}, refresh token: {})",
            provider,
            user_id,
            integration.id,
            token.refresh_token.is_some()
        );

        Ok(ExchangeResponse {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_at,
            user,
        })
    }

    pub async fn fetch_feed(&self, user_id: &str, kind: FeedKind) -> Result<Feed> {
        let connector = self.registry.require(kind.provider())?;
        connector.fetch(&self.context(), user_id, kind).await
    }

    pub async fn status(&self, user_id: &str) -> Result<Vec<IntegrationStatus>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_for_user(user_id)
            .await?
            .iter()
            .map(|i| IntegrationStatus::from_integration(i, now))
            .collect())
    }

    pub async fn provider_status(&self, user_id: &str, provider: Provider) -> Result<IntegrationStatus> {
        self.store
            .get(user_id, provider.as_str())
            .await?
            .map(|i| IntegrationStatus::from_integration(&i, Utc::now()))
            .ok_or_else(|| self.not_connected(provider))
    }

    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<()> {
        if !self.store.delete(user_id, provider.as_str()).await? {
            return Err(self.not_connected(provider));
        }
        info!("disconnected {} for user {}", provider, user_id);
        Ok(())
    }

    /// Store a webhook URL on the caller's row, creating it when needed.
    pub async fn set_webhook(
        &self,
        user_id: &str,
        provider: Provider,
        webhook_url: &str,
    ) -> Result<IntegrationStatus> {
        let webhook_url = validate_webhook_url(webhook_url)?;
        let integration = self
            .store
            .set_webhook_url(user_id, provider.as_str(), &webhook_url)
            .await?;
        Ok(IntegrationStatus::from_integration(&integration, Utc::now()))
    }

    /// Link the caller's Slack workspace through a Merge Link public token.
    pub async fn link_merge_account(&self, user_id: &str, public_token: &str) -> Result<IntegrationStatus> {
        let account = providers::exchange_public_token(&self.context(), public_token).await?;
        let integration = self
            .store
            .set_merge_account(
                user_id,
                Provider::Slack.as_str(),
                &account.account_token,
                account.account_id.as_deref(),
            )
            .await?;
        info!("linked Merge account for user {}", user_id);
        Ok(IntegrationStatus::from_integration(&integration, Utc::now()))
    }

    fn not_connected(&self, provider: Provider) -> Error {
        let name = self
            .config
            .provider(provider)
            .map(|c| c.display_name.as_str())
            .unwrap_or(provider.display_name());
        Error::NotConnected(format!("No {} integration found", name))
    }
}

fn missing_credentials_message(provider: Provider) -> &'static str {
    match provider {
        Provider::Github => "GitHub OAuth credentials not configured",
        Provider::Google => "Missing Google OAuth configuration",
        Provider::Slack => "Missing required Slack credentials",
        Provider::Figma => "Missing required Figma credentials",
    }
}

fn validate_webhook_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|_| Error::InvalidRequest("Invalid webhook URL".to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        _ => Err(Error::InvalidRequest("Invalid webhook URL".to_string())),
    }
}
