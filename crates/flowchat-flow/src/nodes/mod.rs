//! Built-in node executors.
//!
//! Each executor reads its bound inputs from the parameter bag, falling
//! back to defaults where the flow left an input unset, and returns only
//! the output keys it actually produced.

pub mod answer;
pub mod chat;
pub mod classify;
pub mod history;
pub mod kb_search;
pub mod question;

use std::sync::Arc;

use futures::StreamExt;

use flowchat_core::config::ModelConfig;
use flowchat_core::error::Result;
use flowchat_core::params::NodeParams;
use flowchat_core::traits::{EmbeddingProvider, KnowledgeBase, LlmClient, Transport};
use flowchat_core::types::{ChatMessage, StreamDelta, StreamEvent};

/// Collaborators needed by the built-in executors.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub llm: Arc<dyn LlmClient>,
    pub model: ModelConfig,
    pub embeddings: Option<Arc<dyn EmbeddingProvider>>,
    pub knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    /// History window used when a history node leaves `maxContext` unset.
    pub history_context: i64,
}

/// Text and token usage of one completed LLM call.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub text: String,
    pub tokens: u64,
}

/// Drain an LLM stream, optionally forwarding text deltas to the transport.
pub(crate) async fn complete(
    llm: &dyn LlmClient,
    model: &ModelConfig,
    messages: Vec<ChatMessage>,
    forward: Option<&dyn Transport>,
) -> Result<Completion> {
    let mut stream = llm.chat_stream(model, messages).await?;
    let mut completion = Completion::default();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(text) => {
                if let Some(transport) = forward {
                    transport.send(StreamEvent::Answer(text.clone()));
                }
                completion.text.push_str(&text);
            }
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                completion.tokens = input_tokens + output_tokens;
            }
            StreamDelta::Stop(_) => {}
        }
    }

    Ok(completion)
}

/// Read the `history` input. Absent or malformed history reads as empty.
pub(crate) fn history_param(params: &NodeParams) -> Vec<ChatMessage> {
    match params.parse::<Vec<ChatMessage>>("history") {
        Ok(history) => history.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed history input");
            Vec::new()
        }
    }
}

/// Rough token estimate for providers that report no usage.
pub(crate) fn estimate_tokens(messages: &[ChatMessage], reply: &str) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum::<usize>()
        + reply.chars().count();
    (chars / 4) as u64
}
