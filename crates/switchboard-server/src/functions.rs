//! Named functions served under `/functions/v1/{name}`.

use std::fmt;
use std::str::FromStr;

use axum::http::StatusCode;
use switchboard_core::{FeedKind, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFunction {
    /// `get-<provider>-config`
    Config(Provider),
    /// `<provider>-oauth`
    Exchange(Provider),
    /// `fetch-*`
    Fetch(FeedKind),
}

impl EdgeFunction {
    pub const ALL: [EdgeFunction; 13] = [
        EdgeFunction::Config(Provider::Figma),
        EdgeFunction::Config(Provider::Github),
        EdgeFunction::Config(Provider::Google),
        EdgeFunction::Config(Provider::Slack),
        EdgeFunction::Exchange(Provider::Github),
        EdgeFunction::Exchange(Provider::Google),
        EdgeFunction::Exchange(Provider::Slack),
        EdgeFunction::Exchange(Provider::Figma),
        EdgeFunction::Fetch(FeedKind::Gmail),
        EdgeFunction::Fetch(FeedKind::GithubData),
        EdgeFunction::Fetch(FeedKind::SlackMessages),
        EdgeFunction::Fetch(FeedKind::SlackNotifications),
        EdgeFunction::Fetch(FeedKind::FigmaFiles),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EdgeFunction::Config(Provider::Figma) => "get-figma-config",
            EdgeFunction::Config(Provider::Github) => "get-github-config",
            EdgeFunction::Config(Provider::Google) => "get-google-config",
            EdgeFunction::Config(Provider::Slack) => "get-slack-config",
            EdgeFunction::Exchange(Provider::Github) => "github-oauth",
            EdgeFunction::Exchange(Provider::Google) => "google-oauth",
            EdgeFunction::Exchange(Provider::Slack) => "slack-oauth",
            EdgeFunction::Exchange(Provider::Figma) => "figma-oauth",
            EdgeFunction::Fetch(FeedKind::Gmail) => "fetch-gmail",
            EdgeFunction::Fetch(FeedKind::GithubData) => "fetch-github-data",
            EdgeFunction::Fetch(FeedKind::SlackMessages) => "fetch-slack",
            EdgeFunction::Fetch(FeedKind::SlackNotifications) => "fetch-slack-notifications",
            EdgeFunction::Fetch(FeedKind::FigmaFiles) => "fetch-figma",
        }
    }

    /// Config functions answer anonymous callers.
    pub fn requires_session(&self) -> bool {
        !matches!(self, EdgeFunction::Config(_))
    }

    /// Status used for failures without a more specific one.
    pub fn failure_status(&self) -> StatusCode {
        match self {
            EdgeFunction::Config(Provider::Figma) => StatusCode::BAD_REQUEST,
            EdgeFunction::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeFunction::Exchange(_) => StatusCode::BAD_REQUEST,
            EdgeFunction::Fetch(FeedKind::GithubData | FeedKind::FigmaFiles) => StatusCode::BAD_REQUEST,
            EdgeFunction::Fetch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn failure_detail(&self) -> Option<&'static str> {
        match self {
            EdgeFunction::Config(Provider::Figma) => Some("Failed to retrieve Figma configuration"),
            EdgeFunction::Config(Provider::Github) => Some("Failed to retrieve GitHub configuration"),
            EdgeFunction::Config(_) => None,
            EdgeFunction::Exchange(Provider::Github) => Some("Failed to complete GitHub authentication"),
            EdgeFunction::Exchange(Provider::Google) => Some("Failed to complete Google authentication"),
            EdgeFunction::Exchange(Provider::Slack) => Some("Failed to complete Slack authentication"),
            EdgeFunction::Exchange(Provider::Figma) => Some("Failed to complete Figma authentication"),
            EdgeFunction::Fetch(FeedKind::Gmail) => Some(
                "Please try disconnecting and reconnecting your Gmail account. Make sure to grant all required permissions.",
            ),
            EdgeFunction::Fetch(FeedKind::FigmaFiles) => Some("Failed to fetch Figma data"),
            EdgeFunction::Fetch(_) => None,
        }
    }
}

impl fmt::Display for EdgeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EdgeFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeFunction::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| format!("Unknown function: {}", s))
    }
}
