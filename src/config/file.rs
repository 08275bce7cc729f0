//! Configuration file loaded from TOML
//!
//! Every section is optional:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//! data_dir = "./data"
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [reveal]
//! interval_ms = 40
//! chunk_chars = 2
//!
//! [feedback]
//! badge_ms = 2000
//!
//! [prompts]
//! system = "You are a patient tutor..."
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{FeedbackSettings, LlmConfig, RevealSettings};

/// Root of the TOML configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub reveal: RevealSettings,

    #[serde(default)]
    pub feedback: FeedbackSettings,

    #[serde(default)]
    pub prompts: PromptSettings,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(content)?;
        Ok(config)
    }
}

/// Listener and storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Prompt overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSettings {
    /// System instruction prepended to every completion. An empty string
    /// disables it; absent uses the built-in study assistant prompt.
    #[serde(default)]
    pub system: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[server]
host = "0.0.0.0"
port = 8000

[llm]
provider = "local"
model = "qwen2.5-7b-instruct"
base_url = "http://localhost:1234/v1"
temperature = 0.3

[reveal]
interval_ms = 25
chunk_chars = 4

[prompts]
system = "You are a chemistry tutor."
"#;

    #[test]
    fn test_parse_config() {
        let config = FileConfig::from_str(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.llm.provider, "local");
        assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:1234/v1"));
        assert_eq!(config.llm.temperature, Some(0.3));
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.reveal.interval_ms, 25);
        assert_eq!(config.reveal.chunk_chars, 4);
        assert_eq!(config.feedback.badge_ms, 2000);
        assert_eq!(
            config.prompts.system.as_deref(),
            Some("You are a chemistry tutor.")
        );
    }

    #[test]
    fn test_minimal_config() {
        let config = FileConfig::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.llm.provider, "openai"); // Default
        assert_eq!(config.reveal.chunk_chars, 2);
    }

    #[test]
    fn test_invalid_toml() {
        let err = FileConfig::from_str("[llm\nprovider = ").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
