pub mod openai;
pub mod streaming;

use std::sync::Arc;

use tracing::warn;

use flowchat_core::config::ModelConfig;
use flowchat_core::traits::LlmClient;

pub use openai::OpenAiClient;

/// Providers known to speak the OpenAI chat completions protocol.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai", "azure", "ollama", "vllm", "groq", "openrouter", "deepseek", "together",
];

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Arc<dyn LlmClient> {
    if !OPENAI_COMPATIBLE.contains(&config.provider.as_str()) {
        warn!(provider = %config.provider, "Unknown provider, assuming an OpenAI-compatible API");
    }
    Arc::new(OpenAiClient::new())
}
