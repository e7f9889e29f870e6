use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::params::NodeParams;
use crate::types::*;

/// Executes one node kind.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Node kind this executor handles.
    fn flow_type(&self) -> FlowType;

    /// Run the node with its bound inputs.
    ///
    /// The returned values should only use the node's declared output keys;
    /// keys the executor leaves out are treated as undefined.
    fn execute(&self, params: NodeParams, ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>>;
}

/// Client transport for streamed output.
///
/// Closure is the only cancellation signal the engine observes.
pub trait Transport: Send + Sync + 'static {
    /// Whether the remote peer has gone away.
    fn is_closed(&self) -> bool;

    /// Write an event. Writes after closure are dropped.
    fn send(&self, event: StreamEvent);
}

/// Streaming chat completion client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Embedding provider (OpenAI-compatible APIs).
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a batch of texts into vectors.
    fn embed(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Embeddings>>;

    /// Model name, reported in traces.
    fn model(&self) -> &str;

    /// Price per 1000 tokens.
    fn price_per_1k(&self) -> f64 {
        0.0
    }
}

/// Vector retrieval over stored quotes.
pub trait KnowledgeBase: Send + Sync + 'static {
    /// Return quotes from `kb_ids` whose similarity to `vector` exceeds
    /// `similarity`, best first, at most `limit`.
    fn search(
        &self,
        kb_ids: &[String],
        vector: &[f32],
        similarity: f32,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<QuoteItem>>>;
}

/// Chat transcript persistence.
pub trait ChatStore: Send + Sync + 'static {
    /// Load the most recent `limit` messages of a chat, oldest first.
    fn load_history(&self, chat_id: &ChatId, limit: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Append records to a chat, creating it if needed.
    fn save_chat(&self, chat_id: &ChatId, app_id: &str, records: &[ChatRecord]) -> BoxFuture<'_, Result<()>>;
}

/// Usage billing sink.
pub trait BillingSink: Send + Sync + 'static {
    fn push_bill(&self, bill: TaskBill) -> BoxFuture<'_, Result<()>>;
}
