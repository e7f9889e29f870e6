use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Top-level flowchat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Price charged per 1000 tokens.
    #[serde(default)]
    pub price_per_1k: f64,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4000 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    /// Price for a token count.
    pub fn price_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.price_per_1k
    }
}

/// Embedding provider configuration (OpenAI-compatible `/embeddings`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
    #[serde(default)]
    pub price_per_1k: f64,
}

fn default_embedding_dims() -> usize { 1536 }

/// Chat request handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Transcript messages loaded per request.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// History window used by history nodes that don't set `maxContext`.
    #[serde(default = "default_history_context")]
    pub default_history_context: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            default_history_context: default_history_context(),
        }
    }
}

fn default_max_history() -> usize { 30 }
fn default_history_context() -> i64 { 5 }
fn default_workspace() -> String { "~/.flowchat".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        let config = Self::parse(&content)?;
        debug!(path = %path.display(), model = %config.model.model_id, "Config loaded");
        Ok(config)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Path of the SQLite database inside the workspace.
    pub fn database_path(&self) -> PathBuf {
        self.workspace_dir().join("flowchat.db")
    }

    /// Copy of the config safe to print: API keys are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.model.api_key = copy.model.api_key.as_deref().map(mask);
        if let Some(embedding) = copy.embedding.as_mut() {
            embedding.api_key = embedding.api_key.as_deref().map(mask);
        }
        copy
    }
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}****")
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept as written.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => result.push_str(&val),
                    Err(_) => {
                        warn!(var = name, "Config references unset environment variable");
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
