//! Completion providers
//!
//! The engine only sees the [`CompletionGateway`] trait: an ordered list of
//! role/content turns goes in, the text of the top choice comes out.

mod ollama;
mod openai_compat;
#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{prompts_builtin, LlmConfig};
use crate::conversation::ChatTurn;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failure of a single completion call
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No choices in response")]
    NoChoices,

    #[error("Empty title")]
    EmptyTitle,
}

/// Remote chat completion service
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Submit the ordered history and return the top choice's text
    async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError>;

    /// Ask for a short title describing the exchange
    async fn summarize_title(
        &self,
        history: &[ChatTurn],
        generated_reply: &str,
    ) -> Result<String, CompletionError> {
        let request = title_request(history, generated_reply);
        let raw = self.complete(&request).await?;
        clean_title(&raw).ok_or(CompletionError::EmptyTitle)
    }
}

/// Turns sent when summarizing a conversation into a title
pub fn title_request(history: &[ChatTurn], generated_reply: &str) -> Vec<ChatTurn> {
    let mut turns = vec![ChatTurn::system(prompts_builtin::TITLE_INSTRUCTION)];
    turns.extend(
        history
            .iter()
            .filter(|t| t.role != crate::conversation::TurnRole::System)
            .cloned(),
    );
    if !generated_reply.is_empty() {
        turns.push(ChatTurn::assistant(generated_reply));
    }
    turns.push(ChatTurn::user(prompts_builtin::TITLE_REQUEST));
    turns
}

/// First non-empty line, without quotes, a "Title:" label or extra spaces
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line);
    let line = line.trim().trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '`'));
    let title = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

pub enum Provider {
    OpenAICompat(OpenAICompatProvider),
    Ollama(OllamaProvider),
}

impl Provider {
    pub fn from_config(llm: &LlmConfig) -> Result<Self, ProviderError> {
        match llm.provider.to_lowercase().as_str() {
            "openai" => {
                let api_key = llm
                    .api_key
                    .clone()
                    .ok_or_else(|| ProviderError::NotConfigured("OPENAI_API_KEY".into()))?;
                let mut config = OpenAICompatConfig::openai(api_key);
                config.apply(llm);
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(config)?))
            }
            "groq" => {
                let api_key = llm
                    .api_key
                    .clone()
                    .ok_or_else(|| ProviderError::NotConfigured("GROQ_API_KEY".into()))?;
                let mut config = OpenAICompatConfig::groq(api_key);
                config.apply(llm);
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(config)?))
            }
            "local" => {
                let base_url = llm
                    .base_url
                    .clone()
                    .ok_or_else(|| ProviderError::NotConfigured("LLM_BASE_URL".into()))?;
                let mut config = OpenAICompatConfig::local(base_url, llm.model.clone());
                config.apply(llm);
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(config)?))
            }
            "ollama" => {
                let url = llm
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".into());
                Ok(Provider::Ollama(OllamaProvider::new(
                    url,
                    llm.model.clone(),
                    llm.timeout_secs,
                )?))
            }
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAICompat(_) => "openai-compatible",
            Provider::Ollama(_) => "ollama",
        }
    }
}

#[async_trait]
impl CompletionGateway for Provider {
    async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError> {
        match self {
            Provider::OpenAICompat(p) => p.complete(history).await,
            Provider::Ollama(p) => p.complete(history).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::TurnRole;
    use std::sync::Mutex;

    struct FixedGateway {
        answer: &'static str,
        seen: Mutex<Vec<ChatTurn>>,
    }

    #[async_trait]
    impl CompletionGateway for FixedGateway {
        async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError> {
            *self.seen.lock().unwrap() = history.to_vec();
            Ok(self.answer.to_string())
        }
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(
            clean_title("\"Understanding Cell Membranes\"\n").as_deref(),
            Some("Understanding Cell Membranes")
        );
        assert_eq!(
            clean_title("Title:   Newton's   Laws of Motion").as_deref(),
            Some("Newton's Laws of Motion")
        );
        assert_eq!(clean_title("  \n \"\" "), None);
    }

    #[test]
    fn test_title_request_shape() {
        let history = vec![ChatTurn::system("be helpful"), ChatTurn::user("What is a prime?")];
        let turns = title_request(&history, "A prime has exactly two divisors.");

        assert_eq!(turns[0].role, TurnRole::System);
        assert_eq!(turns[0].content, prompts_builtin::TITLE_INSTRUCTION);
        assert_eq!(turns[1], ChatTurn::user("What is a prime?"));
        assert_eq!(turns[2], ChatTurn::assistant("A prime has exactly two divisors."));
        assert_eq!(turns.last().unwrap().role, TurnRole::User);
        assert_eq!(
            turns.iter().filter(|t| t.role == TurnRole::System).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_default_summarize_title() {
        let gateway = FixedGateway {
            answer: "'Prime Numbers Explained'",
            seen: Mutex::new(Vec::new()),
        };
        let title = gateway
            .summarize_title(&[ChatTurn::user("What is a prime?")], "Two divisors.")
            .await
            .unwrap();
        assert_eq!(title, "Prime Numbers Explained");
        assert_eq!(gateway.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_blank_title_is_error() {
        let gateway = FixedGateway {
            answer: "   ",
            seen: Mutex::new(Vec::new()),
        };
        let err = gateway.summarize_title(&[], "").await.unwrap_err();
        assert!(matches!(err, CompletionError::EmptyTitle));
    }

    #[test]
    fn test_provider_selection() {
        let mut llm = LlmConfig::default();
        llm.provider = "openai".into();
        llm.api_key = None;
        assert!(matches!(
            Provider::from_config(&llm),
            Err(ProviderError::NotConfigured(_))
        ));

        llm.provider = "ollama".into();
        assert_eq!(Provider::from_config(&llm).unwrap().name(), "ollama");

        llm.provider = "carrier-pigeon".into();
        assert!(matches!(
            Provider::from_config(&llm),
            Err(ProviderError::UnknownProvider(_))
        ));
    }
}
