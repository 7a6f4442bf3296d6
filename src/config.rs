use crate::credentials::{CredentialSource, DEFAULT_API_KEY_VAR};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Placeholder substituted with the recording path in `recorder_command`
pub const RECORDER_OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub transcription_prompt: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    /// `KEY=value` file consulted when neither config nor environment has a key
    #[serde(default)]
    pub credentials_file: Option<String>,

    /// Recorder argv; `{output}` is replaced with the temp recording path
    #[serde(default)]
    pub recorder_command: Option<Vec<String>>,

    #[serde(default)]
    pub word_overrides: HashMap<String, String>,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            transcription_model: default_transcription_model(),
            language: None,
            transcription_prompt: None,
            system_prompt: None,
            credentials_file: None,
            recorder_command: None,
            word_overrides: HashMap::new(),
        }
    }
}

/// Per-request settings handed to the chat client and the transcription step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub model: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub transcription_model: String,
    pub language: Option<String>,
    pub transcription_prompt: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Config::default().chat_settings()
    }
}

impl ChatSettings {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), path)
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/parley/config.json)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("parley"))
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(anyhow::anyhow!("api_url cannot be empty"));
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(anyhow::anyhow!("api_url must start with http:// or https://"));
        }

        if self.model.is_empty() {
            return Err(anyhow::anyhow!("model cannot be empty"));
        }

        if self.transcription_model.is_empty() {
            return Err(anyhow::anyhow!("transcription_model cannot be empty"));
        }

        if let Some(command) = &self.recorder_command {
            if command.is_empty() {
                return Err(anyhow::anyhow!("recorder_command cannot be empty"));
            }
            if !command.iter().any(|arg| arg.contains(RECORDER_OUTPUT_PLACEHOLDER)) {
                return Err(anyhow::anyhow!(
                    "recorder_command must contain the {} placeholder",
                    RECORDER_OUTPUT_PLACEHOLDER
                ));
            }
        }

        Ok(())
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model.clone(),
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            transcription_model: self.transcription_model.clone(),
            language: self.language.clone(),
            transcription_prompt: self.transcription_prompt.clone(),
        }
    }

    /// Credential lookup chain; the key file defaults to `credentials` next to the config
    pub fn credential_source(&self) -> CredentialSource {
        let file = match &self.credentials_file {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::config_dir().ok().map(|dir| dir.join("credentials")),
        };

        CredentialSource::new(DEFAULT_API_KEY_VAR, file)
    }
}
