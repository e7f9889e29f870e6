use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use flowchat_core::error::{FlowError, Result};
use flowchat_core::traits::{BillingSink, ChatStore, Transport};
use flowchat_core::types::{
    BillSource, ChatId, ChatMessage, ChatRecord, Role, StreamEvent, TaskBill, TraceRecord,
};

use crate::graph::{AppDefinition, DispatchRequest, FlowDispatcher};

/// Marker sent as the last answer chunk of a streamed reply.
pub const DONE_MARKER: &str = "[DONE]";

/// One chat turn against an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// `None` runs without history or persistence, `Some("")` starts a new
    /// chat, anything else continues an existing one.
    #[serde(default)]
    pub chat_id: Option<String>,
    pub app: AppDefinition,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub source: BillSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub answer_text: String,
    pub response_data: Vec<TraceRecord>,
}

/// Runs chat turns: history in, flow dispatch, transcript and bill out.
pub struct ChatService {
    dispatcher: FlowDispatcher,
    store: Option<Arc<dyn ChatStore>>,
    billing: Option<Arc<dyn BillingSink>>,
    max_history: usize,
}

impl ChatService {
    pub fn new(dispatcher: FlowDispatcher) -> Self {
        Self {
            dispatcher,
            store: None,
            billing: None,
            max_history: 30,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_billing(mut self, billing: Arc<dyn BillingSink>) -> Self {
        self.billing = Some(billing);
        self
    }

    /// Transcript messages loaded per request.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Run one chat turn.
    ///
    /// When the request streams, failures are also written to `transport`
    /// as a terminal error event.
    pub async fn complete(
        &self,
        request: ChatRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<ChatResponse> {
        let stream = request.stream;
        let result = self.run(request, transport.clone()).await;

        if let Err(e) = &result {
            error!(error = %e, "Chat request failed");
            if stream {
                transport.send(StreamEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn run(&self, request: ChatRequest, transport: Arc<dyn Transport>) -> Result<ChatResponse> {
        let start = Instant::now();
        let ChatRequest {
            chat_id,
            app,
            messages,
            variables,
            stream,
            source,
        } = request;

        let (chat_id, existing) = match chat_id {
            None => (None, false),
            Some(id) if id.is_empty() => (Some(ChatId::new()), false),
            Some(id) => (Some(ChatId::from_string(&id)), true),
        };

        info!(
            app_id = %app.id,
            chat_id = chat_id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
            stream,
            "Chat request"
        );

        let mut history = match (&chat_id, &self.store) {
            (Some(id), Some(store)) if existing => store.load_history(id, self.max_history).await?,
            _ => Vec::new(),
        };
        history.extend(messages);

        if history.last().is_some_and(|m| m.role == Role::Assistant) {
            history.pop();
        }
        let question = history
            .pop()
            .ok_or_else(|| FlowError::MissingInput("question is empty".into()))?;
        debug!(history = history.len(), "Prepared chat history");

        let mut params = Map::new();
        params.insert("history".into(), serde_json::to_value(&history)?);
        params.insert("userChatInput".into(), Value::String(question.content.clone()));

        let outcome = self
            .dispatcher
            .dispatch(DispatchRequest {
                modules: &app.modules,
                variables,
                params,
                stream,
                transport: transport.clone(),
            })
            .await?;

        if outcome.answer_text.is_empty() {
            return Err(FlowError::EmptyAnswer);
        }

        if let Some(id) = &chat_id {
            match &self.store {
                Some(store) => {
                    let records = [
                        ChatRecord {
                            message: question,
                            response_data: Vec::new(),
                        },
                        ChatRecord {
                            message: ChatMessage::assistant(outcome.answer_text.clone()),
                            response_data: outcome.response_data.clone(),
                        },
                    ];
                    store.save_chat(id, &app.id, &records).await?;
                }
                None => warn!(chat_id = %id, "No chat store configured, turn not saved"),
            }
        }

        if stream {
            transport.send(StreamEvent::Answer(DONE_MARKER.to_string()));
            transport.send(StreamEvent::AppStreamResponse(outcome.response_data.clone()));
        }

        if let Some(billing) = &self.billing {
            let bill = TaskBill::from_trace(&app.id, &app.name, source, &outcome.response_data);
            let total = bill.total;
            if let Err(e) = billing.push_bill(bill).await {
                error!(app_id = %app.id, error = %e, "Failed to record bill");
            } else {
                debug!(app_id = %app.id, total, "Bill recorded");
            }
        }

        info!(
            app_id = %app.id,
            answer_len = outcome.answer_text.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat request complete"
        );

        Ok(ChatResponse {
            chat_id: chat_id.map(|id| id.to_string()),
            answer_text: outcome.answer_text,
            response_data: outcome.response_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::transport::NullTransport;
    use flowchat_core::types::{FlowType, NodeOutput};
    use flowchat_test_utils::{FnExecutor, MemoryBilling, MemoryChatStore, RecordingTransport};
    use serde_json::json;

    use crate::graph::ModuleDefinition;
    use crate::registry::ExecutorRegistry;

    /// Question input wired straight into an echoing answer node.
    fn echo_app() -> AppDefinition {
        AppDefinition {
            id: "app1".into(),
            name: "Echo".into(),
            modules: vec![
                ModuleDefinition::new("q", "questionInput")
                    .with_input("userChatInput")
                    .with_output("userChatInput", &[("a", "text")]),
                ModuleDefinition::new("a", "answerNode")
                    .with_input("text")
                    .with_output("answerText", &[]),
            ],
        }
    }

    fn echo_service() -> ChatService {
        let mut registry = ExecutorRegistry::new();
        registry.register(FnExecutor::new(FlowType::QuestionInput, |params, _| async move {
            Ok(NodeOutput {
                values: params.data().clone(),
                trace: None,
            })
        }));
        registry.register(FnExecutor::new(FlowType::AnswerNode, |params, _| async move {
            let text = params.get_str("text").unwrap_or_default().to_uppercase();
            Ok(NodeOutput::new()
                .with_value("answerText", json!(text))
                .with_trace(TraceRecord::new("Answer").with_usage("m", 10, 0.25)))
        }));
        ChatService::new(FlowDispatcher::new(Arc::new(registry)))
    }

    fn request(chat_id: Option<&str>, messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            chat_id: chat_id.map(String::from),
            app: echo_app(),
            messages,
            variables: Map::new(),
            stream: false,
            source: BillSource::Api,
        }
    }

    #[tokio::test]
    async fn test_answer_and_bill() {
        let billing = Arc::new(MemoryBilling::new());
        let service = echo_service().with_billing(billing.clone());

        let response = service
            .complete(request(None, vec![ChatMessage::user("hello")]), Arc::new(NullTransport))
            .await
            .unwrap();

        assert_eq!(response.answer_text, "HELLO");
        assert!(response.chat_id.is_none());
        let bills = billing.bills();
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].source, BillSource::Api);
        assert!((bills[0].total - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trailing_assistant_dropped() {
        let service = echo_service();
        let response = service
            .complete(
                request(
                    None,
                    vec![ChatMessage::user("question"), ChatMessage::assistant("stale")],
                ),
                Arc::new(NullTransport),
            )
            .await
            .unwrap();
        assert_eq!(response.answer_text, "QUESTION");
    }

    #[tokio::test]
    async fn test_missing_question_fails_and_streams_error() {
        let service = echo_service();
        let transport = Arc::new(RecordingTransport::new());
        let mut req = request(None, Vec::new());
        req.stream = true;

        let err = service.complete(req, transport.clone()).await.unwrap_err();
        assert!(matches!(err, FlowError::MissingInput(_)));
        let events = transport.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_blank_question_reaches_the_flow() {
        let service = echo_service();
        let response = service
            .complete(request(None, vec![ChatMessage::user("  ")]), Arc::new(NullTransport))
            .await
            .unwrap();
        assert_eq!(response.answer_text, "  ");
    }

    #[tokio::test]
    async fn test_empty_answer_is_error() {
        let service = ChatService::new(FlowDispatcher::new(Arc::new(ExecutorRegistry::new())));
        let err = service
            .complete(request(None, vec![ChatMessage::user("hi")]), Arc::new(NullTransport))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::EmptyAnswer));
    }

    #[tokio::test]
    async fn test_new_chat_saved_and_continued() {
        let store = Arc::new(MemoryChatStore::new());
        let service = echo_service().with_store(store.clone());

        let first = service
            .complete(request(Some(""), vec![ChatMessage::user("one")]), Arc::new(NullTransport))
            .await
            .unwrap();
        let chat_id = first.chat_id.unwrap();
        assert!(!chat_id.is_empty());

        let records = store.records(&chat_id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message.content, "one");
        assert_eq!(records[1].message.content, "ONE");
        assert_eq!(records[1].response_data.len(), 1);

        service
            .complete(request(Some(&chat_id), vec![ChatMessage::user("two")]), Arc::new(NullTransport))
            .await
            .unwrap();
        assert_eq!(store.records(&chat_id).len(), 4);
    }

    #[tokio::test]
    async fn test_streaming_ends_with_done_and_trace() {
        let service = echo_service();
        let transport = Arc::new(RecordingTransport::new());
        let mut req = request(None, vec![ChatMessage::user("hi")]);
        req.stream = true;

        service.complete(req, transport.clone()).await.unwrap();
        let events = transport.events();
        let n = events.len();
        assert_eq!(events[n - 2], StreamEvent::Answer("[DONE]".into()));
        assert!(matches!(&events[n - 1], StreamEvent::AppStreamResponse(trace) if trace.len() == 1));
    }
}
