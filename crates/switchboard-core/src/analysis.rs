//! Urgency, sentiment and topic classification for Slack notifications.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::providers::config::{join_url, AnalysisConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub urgency: String,
    pub sentiment: String,
    pub topic: String,
}

impl Analysis {
    fn fallback(topic: &str) -> Self {
        Self {
            urgency: "Low".to_string(),
            sentiment: "Neutral".to_string(),
            topic: topic.to_string(),
        }
    }

    pub fn not_configured() -> Self {
        Self::fallback("No analysis")
    }

    pub fn failed() -> Self {
        Self::fallback("Analysis failed")
    }
}

#[derive(Debug, Clone)]
pub struct MessageAnalyzer {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl MessageAnalyzer {
    pub fn new(http_client: reqwest::Client, config: &AnalysisConfig) -> Self {
        Self {
            http_client,
            endpoint: join_url(&config.base_url, "/v1/chat/completions"),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
        }
    }

    /// Classify one message. Never fails: an unconfigured analyzer or a
    /// failed call yields the neutral fallback.
    pub async fn analyze(&self, message: &str) -> Analysis {
        let Some(api_key) = self.api_key.as_deref() else {
            return Analysis::not_configured();
        };

        match self.request(api_key, message).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!("message analysis failed: {}", err);
                Analysis::failed()
            }
        }
    }

    async fn request(&self, api_key: &str, message: &str) -> anyhow::Result<Analysis> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt(message) }],
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analysis endpoint returned {}", status);
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_else(|| "{}".to_string());

        let analysis: Analysis = serde_json::from_str(content.trim())?;
        info!("classified message as {} / {}", analysis.urgency, analysis.sentiment);
        Ok(analysis)
    }
}

fn prompt(message: &str) -> String {
    format!(
        "Analyze this Slack message and provide:\n\
         1. Urgency (Critical, High, Medium, Low)\n\
         2. Sentiment (Positive, Neutral, Negative)\n\
         3. Topic Summary (in 3-4 words)\n\n\
         Message: \"{}\"\n\n\
         Respond in JSON format only:\n\
         {{\"urgency\": \"\", \"sentiment\": \"\", \"topic\": \"\"}}",
        message
    )
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
