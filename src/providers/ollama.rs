//! Ollama provider implementation

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::conversation::ChatTurn;

use super::{CompletionError, CompletionGateway, ProviderError};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait]
impl CompletionGateway for OllamaProvider {
    async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            messages: history
                .iter()
                .map(|t| OllamaMessage {
                    role: t.role.as_str().to_string(),
                    content: t.content.clone(),
                })
                .collect(),
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let ollama_response: OllamaResponse = response.json().await?;

        ollama_response
            .message
            .map(|m| m.content)
            .ok_or(CompletionError::NoChoices)
    }
}
