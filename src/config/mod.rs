//! Application configuration
//!
//! Settings come from an optional TOML file (see [`file`]) with environment
//! variables layered on top.

pub mod file;
pub mod prompts;

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use file::{ConfigError, FileConfig};
pub use prompts::builtin as prompts_builtin;

const DEFAULT_CONFIG_PATH: &str = "studymate.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub llm: LlmConfig,
    pub reveal: RevealSettings,
    pub feedback: FeedbackSettings,
    /// Leading system instruction for completions; `None` sends none
    pub system_prompt: Option<String>,
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai", "groq", "local", "ollama"
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Custom API endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Resolved from the environment, never read from the file
    #[serde(skip)]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> Option<f32> {
    Some(0.7)
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: None,
            api_key: None,
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    /// Name of the environment variable the API key is read from
    pub fn key_variable(&self) -> String {
        if let Some(ref name) = self.api_key_env {
            return name.clone();
        }
        match self.provider.to_lowercase().as_str() {
            "groq" => "GROQ_API_KEY".to_string(),
            "local" => "LLM_API_KEY".to_string(),
            _ => "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Typing-animation cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Characters appended per tick
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

fn default_interval_ms() -> u64 {
    40
}

fn default_chunk_chars() -> usize {
    2
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

impl RevealSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Transient badge timing (copy/share/like confirmations)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackSettings {
    #[serde(default = "default_badge_ms")]
    pub badge_ms: u64,
}

fn default_badge_ms() -> u64 {
    2000
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            badge_ms: default_badge_ms(),
        }
    }
}

impl FeedbackSettings {
    pub fn badge_duration(&self) -> Duration {
        Duration::from_millis(self.badge_ms)
    }
}

impl Config {
    /// Load the TOML file named by `STUDYMATE_CONFIG` (or `studymate.toml`
    /// when present), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("STUDYMATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let file = if Path::new(&path).exists() {
            tracing::info!(path = %path.display(), "Loading configuration file");
            FileConfig::from_file(&path)?
        } else {
            FileConfig::default()
        };

        Self::from_parts(file, |name| env::var(name).ok())
    }

    /// Build a config from file settings and an environment lookup
    pub fn from_parts<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut llm = file.llm;
        if let Some(provider) = lookup("LLM_PROVIDER") {
            llm.provider = provider;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            llm.model = model;
        }
        if let Some(base_url) = lookup("LLM_BASE_URL") {
            llm.base_url = Some(base_url);
        } else if llm.provider.eq_ignore_ascii_case("ollama") {
            if let Some(url) = lookup("OLLAMA_URL") {
                llm.base_url = Some(url);
            }
        }
        llm.api_key = lookup(&llm.key_variable());

        let port = match lookup("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| ConfigError::Validation(format!("PORT is not a port number: {}", p)))?,
            None => file.server.port,
        };

        let system_prompt = match file.prompts.system {
            None => Some(prompts_builtin::STUDY_ASSISTANT.to_string()),
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(s),
        };

        let config = Self {
            host: lookup("HOST").unwrap_or(file.server.host),
            port,
            data_dir: lookup("STUDYMATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(file.server.data_dir),
            llm,
            reveal: file.reveal,
            feedback: file.feedback,
            system_prompt,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reveal.chunk_chars == 0 {
            return Err(ConfigError::Validation(
                "reveal.chunk_chars must be at least 1".into(),
            ));
        }
        if self.reveal.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reveal.interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("studymate.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_parts(FileConfig::default(), env_of(&[])).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.reveal, RevealSettings::default());
        assert_eq!(config.reveal.interval(), Duration::from_millis(40));
        assert_eq!(config.feedback.badge_duration(), Duration::from_secs(2));
        assert_eq!(
            config.system_prompt.as_deref(),
            Some(prompts_builtin::STUDY_ASSISTANT)
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_parts(
            FileConfig::default(),
            env_of(&[
                ("PORT", "8080"),
                ("LLM_PROVIDER", "groq"),
                ("GROQ_API_KEY", "gsk-test"),
                ("STUDYMATE_DATA_DIR", "/var/lib/studymate"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.llm.provider, "groq");
        assert_eq!(config.llm.api_key.as_deref(), Some("gsk-test"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/studymate/studymate.db")
        );
    }

    #[test]
    fn test_ollama_url() {
        let file = FileConfig::from_str("[llm]\nprovider = \"ollama\"\nmodel = \"llama3.2\"\n").unwrap();
        let config =
            Config::from_parts(file, env_of(&[("OLLAMA_URL", "http://gpu-box:11434")])).unwrap();
        assert_eq!(config.llm.base_url.as_deref(), Some("http://gpu-box:11434"));
    }

    #[test]
    fn test_bad_port() {
        let err = Config::from_parts(FileConfig::default(), env_of(&[("PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let file = FileConfig::from_str("[reveal]\nchunk_chars = 0\n").unwrap();
        assert!(Config::from_parts(file, env_of(&[])).is_err());
    }

    #[test]
    fn test_empty_system_prompt_disables_it() {
        let file = FileConfig::from_str("[prompts]\nsystem = \"\"\n").unwrap();
        let config = Config::from_parts(file, env_of(&[])).unwrap();
        assert!(config.system_prompt.is_none());
    }
}
