//! Provider connectors.
//!
//! This module provides:
//! - `Connector` trait that every provider implements
//! - `ProviderRegistry` for dispatching to the enabled connectors
//! - `call_with_backoff` for rate-limited upstream APIs
//!
//! # Adding a New Provider
//!
//! 1. Add a default entry in `config::default_providers()`
//! 2. Create a new file in `providers/` implementing `Connector`
//! 3. Register it in `ProviderRegistry::register_builtin_connectors()`

pub mod config;

mod figma;
mod github;
mod google;
mod slack;

pub use config::{BackoffPolicy, ProviderConfig, SwitchboardConfig};
pub use figma::{FigmaComment, FigmaConnector, FigmaFile, FigmaFeed};
pub use github::{GithubConnector, GithubFeed, GithubRepository, GithubUser};
pub use google::{GmailConnector, GmailFeed, GmailMessage};
pub use slack::{
    exchange_public_token, MergeAccount, SlackConnector, SlackMessage, SlackMessagesFeed,
    SlackNotification, SlackNotificationsFeed,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use switchboard_auth_bridge::{AuthBridge, AuthToken, Provider};
use switchboard_store::{Integration, IntegrationStore};
use tokio::time::sleep;
use tracing::warn;

use crate::analysis::MessageAnalyzer;
use crate::error::{Error, Result};

/// One read-only data view exposed to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Gmail,
    GithubData,
    SlackMessages,
    SlackNotifications,
    FigmaFiles,
}

impl FeedKind {
    pub fn provider(&self) -> Provider {
        match self {
            FeedKind::Gmail => Provider::Google,
            FeedKind::GithubData => Provider::Github,
            FeedKind::SlackMessages | FeedKind::SlackNotifications => Provider::Slack,
            FeedKind::FigmaFiles => Provider::Figma,
        }
    }
}

/// Display records returned by a connector, serialized as the inner payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Feed {
    Gmail(GmailFeed),
    Github(GithubFeed),
    SlackMessages(SlackMessagesFeed),
    SlackNotifications(SlackNotificationsFeed),
    Figma(FigmaFeed),
}

/// Shared resources handed to connectors.
pub struct ConnectorContext<'a> {
    pub http_client: &'a reqwest::Client,
    pub config: &'a SwitchboardConfig,
    pub store: &'a IntegrationStore,
    pub bridge: &'a AuthBridge,
    pub analyzer: &'a MessageAnalyzer,
}

impl<'a> ConnectorContext<'a> {
    pub fn provider_config(&self, provider: Provider) -> Result<&'a ProviderConfig> {
        self.config.provider(provider).ok_or_else(|| {
            Error::MissingConfiguration(format!(
                "{} is not configured",
                provider.display_name()
            ))
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    pub async fn integration(&self, user_id: &str, provider: Provider) -> Result<Option<Integration>> {
        Ok(self.store.get(user_id, provider.as_str()).await?)
    }

    /// Stored integration carrying an access token, or the "not connected" failure.
    pub async fn connected_integration(
        &self,
        user_id: &str,
        provider: Provider,
        label: &str,
    ) -> Result<Integration> {
        match self.integration(user_id, provider).await? {
            Some(integration) if integration.has_access_token() => Ok(integration),
            _ => Err(Error::NotConnected(format!("No {} integration found", label))),
        }
    }
}

/// Client-facing OAuth settings for the dashboard's connect button.
pub struct ConfigRequest<'a> {
    /// `Origin` header of the request, if any.
    pub origin: Option<&'a str>,
    /// Email of the signed-in caller, when a session was presented.
    pub user_email: Option<&'a str>,
}

/// Trait implemented by every provider connector.
#[async_trait]
pub trait Connector: Send + Sync {
    fn provider(&self) -> Provider;

    /// Public client configuration (client id, redirect URI, scopes).
    async fn client_config(
        &self,
        ctx: &ConnectorContext<'_>,
        request: &ConfigRequest<'_>,
    ) -> Result<serde_json::Value>;

    /// Optional identity lookup right after a code exchange. The returned
    /// value is echoed back to the caller as `user`.
    async fn identify(
        &self,
        _ctx: &ConnectorContext<'_>,
        _token: &AuthToken,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Fetch display records for `user_id`.
    async fn fetch(
        &self,
        ctx: &ConnectorContext<'_>,
        user_id: &str,
        kind: FeedKind,
    ) -> Result<Feed>;
}

/// Registry of enabled connectors.
pub struct ProviderRegistry {
    connectors: HashMap<Provider, Arc<dyn Connector>>,
}

impl ProviderRegistry {
    pub fn new(config: &SwitchboardConfig) -> Self {
        Self {
            connectors: Self::register_builtin_connectors(config),
        }
    }

    fn register_builtin_connectors(
        config: &SwitchboardConfig,
    ) -> HashMap<Provider, Arc<dyn Connector>> {
        let builtin: [Arc<dyn Connector>; 4] = [
            Arc::new(GithubConnector),
            Arc::new(GmailConnector),
            Arc::new(SlackConnector),
            Arc::new(FigmaConnector),
        ];

        let mut map: HashMap<Provider, Arc<dyn Connector>> = HashMap::new();
        for connector in builtin {
            let provider = connector.provider();
            if config.is_enabled(provider) {
                map.insert(provider, connector);
            }
        }

        map
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&provider).cloned()
    }

    /// Connector for `provider`, or a configuration failure when it is disabled.
    pub fn require(&self, provider: Provider) -> Result<Arc<dyn Connector>> {
        self.get(provider).ok_or_else(|| {
            Error::MissingConfiguration(format!("{} integration is disabled", provider.display_name()))
        })
    }

    pub fn is_available(&self, provider: Provider) -> bool {
        self.connectors.contains_key(&provider)
    }

    pub fn list_available(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.connectors.contains_key(p))
            .collect()
    }
}

/// Send a request, retrying 429 (honouring `Retry-After`) and 5xx responses
/// according to `policy`. The final response is returned whatever its status,
/// so callers can read upstream error bodies.
pub async fn call_with_backoff<F>(
    label: &str,
    policy: &BackoffPolicy,
    mut builder_fn: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let max_delay = Duration::from_millis(policy.max_delay_ms);
    let mut delay = Duration::from_millis(policy.initial_delay_ms).min(max_delay);
    let mut rate_limit_retries = 0;
    let mut server_error_retries = 0;

    loop {
        let response = builder_fn().send().await?;
        let status = response.status();

        if status.as_u16() == 429 && rate_limit_retries < policy.max_rate_limit_retries {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(delay)
                .min(max_delay);

            warn!("{}: rate limited, waiting {:?}", label, wait);
            sleep(wait).await;

            rate_limit_retries += 1;
            delay = std::cmp::min(delay * 2, max_delay);
            continue;
        }

        if status.is_server_error() && server_error_retries < policy.max_server_error_retries {
            warn!("{}: server error {}, retrying...", label, status);
            sleep(delay).await;
            server_error_retries += 1;
            delay = std::cmp::min(delay * 2, max_delay);
            continue;
        }

        return Ok(response);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_backoff_retries_rate_limit_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/limited",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "0")], "slow down")
                    } else {
                        (StatusCode::OK, [("Retry-After", "0")], "ok")
                    }
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let client = reqwest::Client::new();

        let response = call_with_backoff("test", &fast_backoff(), || {
            client.get(format!("{}/limited", base))
        })
        .await
        .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_on_server_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/broken",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::BAD_GATEWAY, "down")
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let client = reqwest::Client::new();

        let response = call_with_backoff("test", &fast_backoff(), || {
            client.get(format!("{}/broken", base))
        })
        .await
        .unwrap();

        assert_eq!(response.status().as_u16(), 502);
        // One attempt plus three retries.
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_registry_respects_enabled_flag() {
        let mut config = SwitchboardConfig::default();
        if let Some(figma) = config.provider_mut(Provider::Figma) {
            figma.enabled = false;
        }
        let registry = ProviderRegistry::new(&config);

        assert!(registry.is_available(Provider::Github));
        assert!(!registry.is_available(Provider::Figma));
        for provider in registry.list_available() {
            assert_eq!(registry.get(provider).unwrap().provider(), provider);
        }
        assert_eq!(
            registry.list_available(),
            vec![Provider::Github, Provider::Google, Provider::Slack]
        );
        assert!(matches!(
            registry.require(Provider::Figma),
            Err(Error::MissingConfiguration(_))
        ));
    }

    #[test]
    fn test_feed_kind_provider() {
        assert_eq!(FeedKind::Gmail.provider(), Provider::Google);
        assert_eq!(FeedKind::SlackNotifications.provider(), Provider::Slack);
    }
}
