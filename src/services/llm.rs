//! LLM service for memory consolidation
//!
//! Provides the Claude-backed [`ReasoningOracle`]:
//! - Batch review of expired memories during the sleep cycle
//! - Free-form reflection for the think cycle

use crate::services::oracle::{
    reflection_prompt, review_prompt, OracleError, ReasoningOracle, ReviewItem,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

/// Configuration for LLM service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Anthropic API key; read from `ANTHROPIC_API_KEY`, never written out
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Model to use (default: claude-3-5-haiku-20241022)
    pub model: String,

    /// Messages endpoint
    pub api_url: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
        }
    }
}

/// LLM service backing the reasoning oracle
pub struct LlmService {
    config: LlmConfig,
    client: reqwest::Client,
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    text: String,
}

impl LlmService {
    /// Create a new LLM service with custom config
    pub fn new(config: LlmConfig) -> Result<Self, OracleError> {
        if config.api_key.trim().is_empty() {
            return Err(OracleError::NotConfigured(
                "ANTHROPIC_API_KEY not set".to_string(),
            ));
        }

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create with default config
    pub fn with_default() -> Result<Self, OracleError> {
        Self::new(LlmConfig::default())
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Make an API call to Claude
    async fn call_api(&self, prompt: &str) -> Result<String, OracleError> {
        debug!("Calling Anthropic API ({} prompt chars)", prompt.len());

        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(OracleError::Unavailable(format!(
                "API request failed with status {}: {}",
                status, error_text
            )));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("Failed to parse response: {}", e)))?;

        api_response
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| OracleError::Malformed("Empty response from API".to_string()))
    }
}

#[async_trait]
impl ReasoningOracle for LlmService {
    async fn review_batch(&self, items: &[ReviewItem]) -> Result<String, OracleError> {
        debug!("Requesting review of {} memories", items.len());
        self.call_api(&review_prompt(items)).await
    }

    async fn reflect(&self, topic: &str, context: &str) -> Result<String, OracleError> {
        debug!("Requesting reflection on '{}'", topic);
        let text = self.call_api(&reflection_prompt(topic, context)).await?;
        if text.trim().is_empty() {
            return Err(OracleError::Malformed("Empty reflection".to_string()));
        }
        Ok(text)
    }
}
