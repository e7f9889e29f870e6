use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::Transport;

/// Output key whose values are concatenated into the user-visible answer.
pub const ANSWER_TEXT_KEY: &str = "answerText";

/// Unique chat (conversation) identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single chat message, both in transcripts and in LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// A transcript entry as persisted: the message plus the trace of the
/// dispatch that produced it (assistant turns only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_data: Vec<TraceRecord>,
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Node kind tag of a module definition.
///
/// Unknown tags are kept as `Other` so newer flow definitions still load;
/// they dispatch to a no-op.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowType {
    HistoryNode,
    QuestionInput,
    ChatNode,
    KbSearchNode,
    ClassifyQuestion,
    AnswerNode,
    Other(String),
}

impl FlowType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::HistoryNode => "historyNode",
            Self::QuestionInput => "questionInput",
            Self::ChatNode => "chatNode",
            Self::KbSearchNode => "kbSearchNode",
            Self::ClassifyQuestion => "classifyQuestion",
            Self::AnswerNode => "answerNode",
            Self::Other(tag) => tag,
        }
    }

    /// Entry kinds receive the request parameters directly when a dispatch starts.
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::HistoryNode | Self::QuestionInput)
    }
}

impl From<String> for FlowType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "historyNode" => Self::HistoryNode,
            "questionInput" => Self::QuestionInput,
            "chatNode" => Self::ChatNode,
            "kbSearchNode" => Self::KbSearchNode,
            "classifyQuestion" => Self::ClassifyQuestion,
            "answerNode" => Self::AnswerNode,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for FlowType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<FlowType> for String {
    fn from(flow_type: FlowType) -> Self {
        match flow_type {
            FlowType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node execution metadata used for observability and billing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub module_name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens: u64,
    /// Node-specific details (question, quote list, similarity, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TraceRecord {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, model: impl Into<String>, tokens: u64, price: f64) -> Self {
        self.model = Some(model.into());
        self.tokens = tokens;
        self.price = price;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Result bag returned by a node executor.
///
/// Keys absent from `values` are "undefined" and never propagate.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub values: serde_json::Map<String, serde_json::Value>,
    pub trace: Option<TraceRecord>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_trace(mut self, trace: TraceRecord) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Shared request context handed to every executor of one dispatch.
#[derive(Clone)]
pub struct DispatchContext {
    pub stream: bool,
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("stream", &self.stream)
            .field("transport_closed", &self.transport.is_closed())
            .finish()
    }
}

/// Events written to the client transport while a request runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of answer text (or the `[DONE]` marker).
    Answer(String),
    /// The full trace, sent to the app owner once the answer is complete.
    AppStreamResponse(Vec<TraceRecord>),
    /// Terminal error.
    Error(String),
}

impl StreamEvent {
    /// SSE event name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Answer(_) => "answer",
            Self::AppStreamResponse(_) => "appStreamResponse",
            Self::Error(_) => "error",
        }
    }
}

/// A knowledge-base entry returned by retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteItem {
    pub kb_id: String,
    pub id: String,
    pub q: String,
    pub a: String,
    #[serde(default)]
    pub source: String,
}

/// Embedding vectors plus token usage for billing.
#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub tokens: u64,
}

/// Where a billed request came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BillSource {
    #[default]
    Web,
    Api,
}

impl BillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Api => "api",
        }
    }
}

/// One billed line, derived from a trace record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BillItem {
    pub module_name: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tokens: u64,
}

/// Usage bill for one chat request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskBill {
    pub app_id: String,
    pub app_name: String,
    pub source: BillSource,
    pub total: f64,
    pub items: Vec<BillItem>,
}

impl TaskBill {
    /// Build a bill from a dispatch trace.
    pub fn from_trace(
        app_id: impl Into<String>,
        app_name: impl Into<String>,
        source: BillSource,
        trace: &[TraceRecord],
    ) -> Self {
        let items: Vec<BillItem> = trace
            .iter()
            .map(|record| BillItem {
                module_name: record.module_name.clone(),
                amount: record.price,
                model: record.model.clone(),
                tokens: record.tokens,
            })
            .collect();
        let total = items.iter().map(|item| item.amount).sum();
        Self {
            app_id: app_id.into(),
            app_name: app_name.into(),
            source,
            total,
            items,
        }
    }
}
