//! OpenAI-compatible provider
//!
//! Works with any API that implements the OpenAI chat completions format:
//! - OpenAI (api.openai.com)
//! - Groq (api.groq.com)
//! - vLLM, LM Studio, LocalAI (local servers)
//!
//! # Configuration
//!
//! ```toml
//! [llm]
//! provider = "openai"
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! temperature = 0.7
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::conversation::ChatTurn;

use super::{CompletionError, CompletionGateway, ProviderError};

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&ChatTurn> for ChatMessage {
    fn from(turn: &ChatTurn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., https://api.openai.com/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAICompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(2048),
            timeout_secs: 120,
        }
    }
}

impl OpenAICompatConfig {
    /// Create config for OpenAI
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Create config for Groq
    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: Some(api_key.into()),
            model: "llama-3.3-70b-versatile".to_string(),
            timeout_secs: 60,
            ..Self::default()
        }
    }

    /// Create config for a local server (vLLM, LM Studio, etc.)
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout_secs: 300, // Local inference can be slower
            ..Self::default()
        }
    }

    /// Overlay the user's LLM settings on a preset
    pub fn apply(&mut self, llm: &LlmConfig) {
        if let Some(ref base_url) = llm.base_url {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        if !llm.model.is_empty() {
            self.model = llm.model.clone();
        }
        if llm.temperature.is_some() {
            self.temperature = llm.temperature;
        }
        self.timeout_secs = llm.timeout_secs;
    }
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    pub fn new(config: OpenAICompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn build_request(&self, history: &[ChatTurn]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: history.iter().map(ChatMessage::from).collect(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }
}

#[async_trait]
impl CompletionGateway for OpenAICompatProvider {
    async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let request = self.build_request(history);

        let mut req_builder = self.client.post(&url);

        // Add authorization if API key is provided
        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        tracing::debug!(model = %request.model, turns = request.messages.len(), "Requesting completion");

        let response = req_builder.json(&request).send().await?;

        let status = response.status();
        let body = response.text().await?;

        parse_completion(status.as_u16(), &body)
    }
}

/// Turn a raw HTTP status and body into the top choice's text
fn parse_completion(status: u16, body: &str) -> Result<String, CompletionError> {
    if !(200..300).contains(&status) {
        // Prefer the API's own error message when it sent one
        if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(body) {
            return Err(CompletionError::Status {
                status,
                body: error_resp.error.message,
            });
        }
        return Err(CompletionError::Status {
            status,
            body: body.to_string(),
        });
    }

    let completion: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        CompletionError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
    })?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(CompletionError::NoChoices)?;

    Ok(choice.message.content.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        let openai = OpenAICompatConfig::openai("test-key");
        assert!(openai.base_url.contains("openai.com"));
        assert_eq!(openai.api_key, Some("test-key".to_string()));

        let groq = OpenAICompatConfig::groq("groq-key");
        assert!(groq.base_url.contains("groq.com"));

        let local = OpenAICompatConfig::local("http://localhost:8000/v1", "llama-3");
        assert!(local.api_key.is_none());
        assert_eq!(local.model, "llama-3");
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = OpenAICompatConfig::openai("k");
        let llm = LlmConfig {
            base_url: Some("https://proxy.example/v1/".into()),
            model: "gpt-4o".into(),
            temperature: Some(0.2),
            timeout_secs: 30,
            ..LlmConfig::default()
        };
        config.apply(&llm);

        assert_eq!(config.base_url, "https://proxy.example/v1");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_message_conversion() {
        let msg = ChatMessage::from(&ChatTurn::user("Hello"));
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn test_parse_success() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there!"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_completion(200, body).unwrap(), "Hi there!");
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_completion(200, r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, CompletionError::NoChoices));
    }

    #[test]
    fn test_parse_api_error() {
        let body = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        match parse_completion(429, body).unwrap_err() {
            CompletionError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "Rate limit reached");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_completion(200, "<html>").unwrap_err();
        assert!(matches!(err, CompletionError::InvalidResponse(_)));
    }
}
