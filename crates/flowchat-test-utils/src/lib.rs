//! Shared mocks and fixtures for flowchat tests.

pub mod fixtures;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use serde_json::Value;

use flowchat_core::config::ModelConfig;
use flowchat_core::error::{FlowError, Result};
use flowchat_core::params::NodeParams;
use flowchat_core::traits::{
    BillingSink, ChatStore, EmbeddingProvider, KnowledgeBase, LlmClient, NodeExecutor, Transport,
};
use flowchat_core::types::{
    ChatId, ChatMessage, ChatRecord, DispatchContext, Embeddings, FlowType, NodeOutput, QuoteItem,
    StopReason, StreamDelta, StreamEvent, TaskBill,
};

// ── Executors ────────────────────────────────────────────────────

type ExecFn = dyn Fn(NodeParams, DispatchContext) -> BoxFuture<'static, Result<NodeOutput>> + Send + Sync;

/// Node executor backed by a closure.
pub struct FnExecutor {
    flow_type: FlowType,
    run: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(flow_type: impl Into<FlowType>, f: F) -> Self
    where
        F: Fn(NodeParams, DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
    {
        Self {
            flow_type: flow_type.into(),
            run: Box::new(move |params, ctx| Box::pin(f(params, ctx))),
        }
    }
}

impl NodeExecutor for FnExecutor {
    fn flow_type(&self) -> FlowType {
        self.flow_type.clone()
    }

    fn execute(&self, params: NodeParams, ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        (self.run)(params, ctx)
    }
}

// ── Transport ────────────────────────────────────────────────────

/// Transport that records every event and can be closed on demand.
#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<StreamEvent>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the client going away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Concatenated text of all answer events.
    pub fn answer_text(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::Answer(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, event: StreamEvent) {
        if !self.is_closed() {
            self.events.lock().unwrap().push(event);
        }
    }
}

/// Non-streaming context over a transport that discards events.
pub fn ctx() -> DispatchContext {
    DispatchContext {
        stream: false,
        transport: Arc::new(RecordingTransport::new()),
    }
}

/// Streaming context writing to `transport`.
pub fn streaming_ctx(transport: Arc<RecordingTransport>) -> DispatchContext {
    DispatchContext {
        stream: true,
        transport,
    }
}

/// Build a parameter bag from a JSON object.
pub fn params(value: Value) -> NodeParams {
    NodeParams::from_map(value.as_object().cloned().unwrap_or_default())
}

// ── LLM ──────────────────────────────────────────────────────────

/// A scripted reply of the mock LLM.
#[derive(Debug, Clone)]
enum Scripted {
    Text(String),
    Error(String),
}

/// LLM that returns scripted replies in order, streamed in small chunks.
/// An exhausted script replies with empty text.
#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Scripted>>,
    usage: Option<(u64, u64)>,
    requests: Mutex<Vec<(ModelConfig, Vec<ChatMessage>)>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Scripted::Text(text.into()));
        self
    }

    /// Fail the next request.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Scripted::Error(message.into()));
        self
    }

    /// Report this usage after every reply.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some((input_tokens, output_tokens));
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<(ModelConfig, Vec<ChatMessage>)> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push((config.clone(), messages));
        let reply = self.replies.lock().unwrap().pop_front();
        let usage = self.usage;

        Box::pin(async move {
            let text = match reply {
                Some(Scripted::Error(message)) => return Err(FlowError::LlmRequest(message)),
                Some(Scripted::Text(text)) => text,
                None => String::new(),
            };

            let chars: Vec<char> = text.chars().collect();
            let mut deltas: Vec<Result<StreamDelta>> = chars
                .chunks(4)
                .map(|chunk| Ok(StreamDelta::TextDelta(chunk.iter().collect())))
                .collect();
            if let Some((input_tokens, output_tokens)) = usage {
                deltas.push(Ok(StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                }));
            }
            deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));

            Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// Default model settings for tests.
pub fn model_config() -> ModelConfig {
    ModelConfig {
        provider: "openai".into(),
        model_id: "test-model".into(),
        api_key: None,
        base_url: None,
        max_tokens: 4000,
        temperature: 0.0,
        price_per_1k: 0.0,
    }
}

// ── Retrieval ────────────────────────────────────────────────────

/// Embedding provider returning fixed vectors.
pub struct MockEmbeddings {
    default: Vec<f32>,
    by_text: HashMap<String, Vec<f32>>,
    tokens: u64,
    price_per_1k: f64,
}

impl MockEmbeddings {
    pub fn new(default: Vec<f32>) -> Self {
        Self {
            default,
            by_text: HashMap::new(),
            tokens: 0,
            price_per_1k: 0.0,
        }
    }

    /// Return `vector` for exactly `text`.
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.by_text.insert(text.into(), vector);
        self
    }

    /// Tokens reported per call.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_price(mut self, price_per_1k: f64) -> Self {
        self.price_per_1k = price_per_1k;
        self
    }
}

impl EmbeddingProvider for MockEmbeddings {
    fn embed(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Embeddings>> {
        Box::pin(async move {
            let vectors = texts
                .iter()
                .map(|text| self.by_text.get(text).unwrap_or(&self.default).clone())
                .collect();
            Ok(Embeddings {
                vectors,
                tokens: self.tokens,
            })
        })
    }

    fn model(&self) -> &str {
        "mock-embedding"
    }

    fn price_per_1k(&self) -> f64 {
        self.price_per_1k
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// In-memory knowledge base with brute-force cosine search.
pub struct StaticKnowledgeBase {
    entries: Vec<(QuoteItem, Vec<f32>)>,
}

impl StaticKnowledgeBase {
    pub fn new(entries: Vec<(QuoteItem, Vec<f32>)>) -> Self {
        Self { entries }
    }
}

impl KnowledgeBase for StaticKnowledgeBase {
    fn search(
        &self,
        kb_ids: &[String],
        vector: &[f32],
        similarity: f32,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<QuoteItem>>> {
        let mut scored: Vec<(f32, QuoteItem)> = self
            .entries
            .iter()
            .filter(|(quote, _)| kb_ids.contains(&quote.kb_id))
            .map(|(quote, v)| (cosine(vector, v), quote.clone()))
            .filter(|(score, _)| *score > similarity)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let found = scored.into_iter().take(limit).map(|(_, q)| q).collect();
        Box::pin(async move { Ok(found) })
    }
}

// ── Persistence ──────────────────────────────────────────────────

/// Chat store holding transcripts in memory.
#[derive(Default)]
pub struct MemoryChatStore {
    chats: Mutex<HashMap<String, Vec<ChatRecord>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, chat_id: &str) -> Vec<ChatRecord> {
        self.chats
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ChatStore for MemoryChatStore {
    fn load_history(&self, chat_id: &ChatId, limit: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let records = self.records(&chat_id.0);
        let skip = records.len().saturating_sub(limit);
        let history = records.into_iter().skip(skip).map(|r| r.message).collect();
        Box::pin(async move { Ok(history) })
    }

    fn save_chat(&self, chat_id: &ChatId, _app_id: &str, records: &[ChatRecord]) -> BoxFuture<'_, Result<()>> {
        self.chats
            .lock()
            .unwrap()
            .entry(chat_id.0.clone())
            .or_default()
            .extend_from_slice(records);
        Box::pin(async { Ok(()) })
    }
}

/// Billing sink collecting bills in memory. Optionally fails every push.
#[derive(Default)]
pub struct MemoryBilling {
    bills: Mutex<Vec<TaskBill>>,
    fail: bool,
}

impl MemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn bills(&self) -> Vec<TaskBill> {
        self.bills.lock().unwrap().clone()
    }
}

impl BillingSink for MemoryBilling {
    fn push_bill(&self, bill: TaskBill) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(FlowError::Database("billing unavailable".into()));
            }
            self.bills.lock().unwrap().push(bill);
            Ok(())
        })
    }
}

// ── Files ────────────────────────────────────────────────────────

/// Write `content` to `name` inside a fresh temp dir.
/// Keep the returned dir alive for as long as the file is needed.
pub fn temp_file(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    (dir, path)
}
