use std::sync::Arc;

use serde_json::{json, Map, Value};

use flowchat_core::config::ModelConfig;
use flowchat_core::traits::{EmbeddingProvider, KnowledgeBase};
use flowchat_core::transport::{ChannelTransport, NullTransport};
use flowchat_core::types::{BillSource, ChatId, ChatMessage, Role, StreamEvent};
use flowchat_flow::service::DONE_MARKER;
use flowchat_flow::{
    AppDefinition, BuiltinDeps, ChatRequest, ChatService, ExecutorRegistry, FlowDispatcher,
};
use flowchat_store::SqliteStore;
use flowchat_test_utils::{fixtures, model_config, MemoryBilling, MockEmbeddings, MockLlmClient};

fn app(id: &str, flow: Value) -> AppDefinition {
    AppDefinition {
        id: id.into(),
        name: format!("{id} app"),
        modules: serde_json::from_value(flow).unwrap(),
    }
}

fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(&dir.path().join("flowchat.db")).unwrap())
}

fn priced_model() -> ModelConfig {
    ModelConfig {
        price_per_1k: 2.0,
        ..model_config()
    }
}

fn service(
    llm: Arc<MockLlmClient>,
    store: Arc<SqliteStore>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
) -> ChatService {
    let registry = ExecutorRegistry::with_builtins(BuiltinDeps {
        llm,
        model: priced_model(),
        embeddings,
        knowledge_base: Some(store.clone() as Arc<dyn KnowledgeBase>),
        history_context: 6,
    });
    ChatService::new(FlowDispatcher::new(Arc::new(registry)))
        .with_store(store.clone())
        .with_billing(store)
}

fn turns(messages: &[ChatMessage]) -> Vec<(Role, &str)> {
    messages.iter().map(|m| (m.role, m.content.as_str())).collect()
}

fn request(chat_id: Option<&str>, app: AppDefinition, question: &str) -> ChatRequest {
    ChatRequest {
        chat_id: chat_id.map(String::from),
        app,
        messages: vec![ChatMessage::user(question)],
        variables: Map::new(),
        stream: false,
        source: BillSource::Api,
    }
}

#[tokio::test]
async fn test_chat_continues_from_stored_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let llm = Arc::new(
        MockLlmClient::new()
            .with_reply("Nice to meet you, Ada.")
            .with_reply("Your name is Ada."),
    );
    let service = service(llm.clone(), store.clone(), None);

    let mut first = request(Some(""), app("simple", fixtures::simple_chat_flow()), "I am Ada");
    first.variables = json!({"name": "Flo"}).as_object().cloned().unwrap();
    let first = service.complete(first, Arc::new(NullTransport)).await.unwrap();
    assert_eq!(first.answer_text, "Nice to meet you, Ada.");
    let chat_id = first.chat_id.unwrap();

    let second = service
        .complete(
            request(Some(&chat_id), app("simple", fixtures::simple_chat_flow()), "Who am I?"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(second.answer_text, "Your name is Ada.");
    assert_eq!(second.chat_id.as_deref(), Some(chat_id.as_str()));

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let (model, first_messages) = &requests[0];
    assert_eq!(model.model_id, "test-model");
    assert_eq!(turns(first_messages)[0], (Role::System, "You are Flo."));

    // Without the variable the token is left as written
    let sent = turns(&requests[1].1);
    assert_eq!(
        sent,
        vec![
            (Role::System, "You are {{name}}."),
            (Role::User, "I am Ada"),
            (Role::Assistant, "Nice to meet you, Ada."),
            (Role::User, "Who am I?"),
        ]
    );

    let records = store.chat_records(&ChatId::from_string(&chat_id)).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[3].message.role, Role::Assistant);
    assert_eq!(records[3].response_data[0].module_name, "AI Chat");
}

#[tokio::test]
async fn test_request_without_chat_id_is_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let llm = Arc::new(MockLlmClient::new().with_reply("Hello."));
    let service = service(llm, store.clone(), None);

    let response = service
        .complete(
            request(None, app("simple", fixtures::simple_chat_flow()), "hi"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert!(response.chat_id.is_none());
    // Still billed
    assert_eq!(store.bills("simple").unwrap().len(), 1);
}

#[tokio::test]
async fn test_knowledge_base_hit_feeds_quotes_to_chat() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .add_quote("faq", "How do refunds work?", "Refunds take 5 days.", "faq.md", &[1.0, 0.0])
        .unwrap();
    store
        .add_quote("other", "Unrelated", "Should not appear.", "", &[1.0, 0.0])
        .unwrap();

    let embeddings = MockEmbeddings::new(vec![0.0, 1.0])
        .with_vector("refunds?", vec![0.9, 0.1])
        .with_tokens(100)
        .with_price(1.0);
    let llm = Arc::new(MockLlmClient::new().with_reply("About 5 days.").with_usage(40, 10));
    let service = service(
        llm.clone(),
        store.clone(),
        Some(Arc::new(embeddings) as Arc<dyn EmbeddingProvider>),
    );

    let response = service
        .complete(
            request(Some(""), app("kb", fixtures::kb_chat_flow("faq")), "refunds?"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(response.answer_text, "About 5 days.");

    let modules: Vec<&str> = response
        .response_data
        .iter()
        .map(|r| r.module_name.as_str())
        .collect();
    assert_eq!(modules, vec!["KB Search", "AI Chat"]);

    let sent = &llm.requests()[0].1;
    let reference = sent
        .iter()
        .find(|m| m.role == Role::System && m.content.starts_with("Reference content:"))
        .unwrap();
    assert!(reference.content.contains("Refunds take 5 days."));
    assert!(!reference.content.contains("Should not appear."));

    let bills = store.bills("kb").unwrap();
    assert_eq!(bills.len(), 1);
    // 100 embedding tokens at 1.0/1k plus 50 chat tokens at 2.0/1k
    assert!((bills[0].total - 0.2).abs() < 1e-9);
    assert_eq!(bills[0].items.len(), 2);
}

#[tokio::test]
async fn test_knowledge_base_miss_uses_fallback_answer() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .add_quote("faq", "How do refunds work?", "Refunds take 5 days.", "", &[1.0, 0.0])
        .unwrap();
    let llm = Arc::new(MockLlmClient::new());
    let service = service(
        llm.clone(),
        store,
        Some(Arc::new(MockEmbeddings::new(vec![0.0, 1.0])) as Arc<dyn EmbeddingProvider>),
    );

    let response = service
        .complete(
            request(None, app("kb", fixtures::kb_chat_flow("faq")), "weather today?"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(response.answer_text, "Sorry, I don't know.");
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn test_kb_flow_without_embeddings_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let service = service(Arc::new(MockLlmClient::new()), store, None);

    let err = service
        .complete(
            request(None, app("kb", fixtures::kb_chat_flow("faq")), "refunds?"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not configured"));
}

#[tokio::test]
async fn test_classifier_routes_to_matching_answer() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let llm = Arc::new(MockLlmClient::new().with_reply("greeting").with_reply(" other\n"));
    let service = service(llm.clone(), store, None);

    let hello = service
        .complete(
            request(None, app("cq", fixtures::classify_flow()), "hey!"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(hello.answer_text, "Hi there!");
    assert_eq!(hello.response_data[0].module_name, "Classify Question");

    let other = service
        .complete(
            request(None, app("cq", fixtures::classify_flow()), "what's 2+2?"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(other.answer_text, "I can only say hello.");
}

#[tokio::test]
async fn test_failing_billing_does_not_fail_request() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let registry = ExecutorRegistry::with_builtins(BuiltinDeps {
        llm: Arc::new(MockLlmClient::new().with_reply("ok")),
        model: model_config(),
        embeddings: None,
        knowledge_base: None,
        history_context: 6,
    });
    let service = ChatService::new(FlowDispatcher::new(Arc::new(registry)))
        .with_store(store)
        .with_billing(Arc::new(MemoryBilling::failing()));

    let response = service
        .complete(
            request(Some(""), app("simple", fixtures::simple_chat_flow()), "hi"),
            Arc::new(NullTransport),
        )
        .await
        .unwrap();
    assert_eq!(response.answer_text, "ok");
}

#[tokio::test]
async fn test_streamed_reply_over_channel() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let llm = Arc::new(MockLlmClient::new().with_reply("Streaming works fine."));
    let service = service(llm, store, None);

    let (transport, mut rx) = ChannelTransport::new();
    let mut req = request(None, app("simple", fixtures::simple_chat_flow()), "stream please");
    req.stream = true;
    let response = service.complete(req, Arc::new(transport)).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Answer(text) if text != DONE_MARKER => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, response.answer_text);

    let n = events.len();
    assert_eq!(events[n - 2], StreamEvent::Answer(DONE_MARKER.into()));
    assert_eq!(
        events[n - 1],
        StreamEvent::AppStreamResponse(response.response_data.clone())
    );
}

#[tokio::test]
async fn test_llm_failure_streams_error_and_saves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let llm = Arc::new(MockLlmClient::new().with_error("upstream 500"));
    let service = service(llm, store.clone(), None);

    let (transport, mut rx) = ChannelTransport::new();
    let mut req = request(Some("chat-err"), app("simple", fixtures::simple_chat_flow()), "hi");
    req.stream = true;
    let err = service.complete(req, Arc::new(transport)).await.unwrap_err();
    assert!(err.to_string().contains("upstream 500"));

    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    assert!(matches!(last, Some(StreamEvent::Error(_))));
    assert!(store
        .chat_records(&ChatId::from_string("chat-err"))
        .unwrap()
        .is_empty());
    assert!(store.bills("simple").unwrap().is_empty());
}
