use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowchat_core::config::ModelConfig;
use flowchat_core::error::{FlowError, Result};
use flowchat_core::params::NodeParams;
use flowchat_core::traits::{LlmClient, NodeExecutor};
use flowchat_core::types::{
    ChatMessage, DispatchContext, FlowType, NodeOutput, QuoteItem, TraceRecord, ANSWER_TEXT_KEY,
};

use super::{complete, estimate_tokens, history_param};

const MODULE_NAME: &str = "AI Chat";

/// LLM completion over the question, history, and retrieved quotes.
pub struct ChatNode {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl ChatNode {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { llm, model }
    }

    /// Model settings with per-node overrides applied.
    fn model_for(&self, params: &NodeParams) -> ModelConfig {
        let mut model = self.model.clone();
        if let Some(id) = params.get_str("model").filter(|id| !id.is_empty()) {
            model.model_id = id.to_string();
        }
        if let Some(temperature) = params.get_f64("temperature") {
            model.temperature = temperature as f32;
        }
        if let Some(max_tokens) = params.get_i64("maxToken").filter(|n| *n > 0) {
            model.max_tokens = max_tokens as u32;
        }
        model
    }
}

/// Render quotes as a numbered reference block.
fn quote_prompt(quotes: &[QuoteItem]) -> String {
    let body = quotes
        .iter()
        .enumerate()
        .map(|(i, quote)| {
            if quote.a.is_empty() {
                format!("{}. {}", i + 1, quote.q)
            } else {
                format!("{}. {}\n{}", i + 1, quote.q, quote.a)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Reference content:\n\"\"\"\n{body}\n\"\"\"")
}

/// Assemble the request: system prompt, quotes, history, limit prompt, question.
pub(crate) fn build_messages(
    system_prompt: Option<&str>,
    quotes: &[QuoteItem],
    history: Vec<ChatMessage>,
    limit_prompt: Option<&str>,
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 4);

    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }
    if !quotes.is_empty() {
        messages.push(ChatMessage::system(quote_prompt(quotes)));
    }
    messages.extend(history);
    if let Some(prompt) = limit_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }
    messages.push(ChatMessage::user(question));

    messages
}

impl NodeExecutor for ChatNode {
    fn flow_type(&self) -> FlowType {
        FlowType::ChatNode
    }

    fn execute(&self, params: NodeParams, ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let question = params
                .get_str("userChatInput")
                .filter(|q| !q.trim().is_empty())
                .ok_or_else(|| FlowError::node(FlowType::ChatNode, "question is empty"))?
                .to_string();

            let model = self.model_for(&params);
            let quotes: Vec<QuoteItem> = params.parse("quoteQA")?.unwrap_or_default();
            let messages = build_messages(
                params.get_str("systemPrompt"),
                &quotes,
                history_param(&params),
                params.get_str("limitPrompt"),
                &question,
            );

            debug!(
                model = %model.model_id,
                messages = messages.len(),
                quotes = quotes.len(),
                "Running chat completion"
            );

            let forward = ctx.stream.then(|| ctx.transport.as_ref());
            let completion = complete(self.llm.as_ref(), &model, messages.clone(), forward).await?;

            let tokens = match completion.tokens {
                0 => estimate_tokens(&messages, &completion.text),
                n => n,
            };

            let mut full_history = messages;
            full_history.push(ChatMessage::assistant(completion.text.clone()));

            let trace = TraceRecord::new(MODULE_NAME)
                .with_usage(model.model_id.clone(), tokens, model.price_for(tokens))
                .with_detail("question", json!(question))
                .with_detail("answer", json!(completion.text))
                .with_detail("maxToken", json!(model.max_tokens))
                .with_detail("quoteList", serde_json::to_value(&quotes)?);

            Ok(NodeOutput::new()
                .with_value(ANSWER_TEXT_KEY, Value::String(completion.text))
                .with_value("history", serde_json::to_value(full_history)?)
                .with_trace(trace))
        })
    }
}
