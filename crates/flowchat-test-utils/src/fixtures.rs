//! Flow definitions as authored JSON, shared by integration tests.

use serde_json::{json, Value};

/// History and question feeding a single chat module.
pub fn simple_chat_flow() -> Value {
    json!([
        {
            "moduleId": "history",
            "flowType": "historyNode",
            "inputs": [
                {"key": "maxContext", "value": 4, "connected": true},
                {"key": "history", "connected": true}
            ],
            "outputs": [
                {"key": "history", "targets": [{"moduleId": "chat", "key": "history"}]}
            ]
        },
        {
            "moduleId": "question",
            "flowType": "questionInput",
            "inputs": [{"key": "userChatInput", "connected": true}],
            "outputs": [
                {"key": "userChatInput", "targets": [{"moduleId": "chat", "key": "userChatInput"}]}
            ]
        },
        {
            "moduleId": "chat",
            "flowType": "chatNode",
            "inputs": [
                {"key": "systemPrompt", "value": "You are {{name}}.", "connected": true},
                {"key": "limitPrompt", "value": "", "connected": false},
                {"key": "history", "connected": true},
                {"key": "userChatInput", "connected": true}
            ],
            "outputs": [
                {"key": "answerText", "targets": []},
                {"key": "history", "targets": []}
            ]
        }
    ])
}

/// Knowledge-base search gating either a chat module (quotes found) or a
/// fixed answer (nothing found).
pub fn kb_chat_flow(kb_id: &str) -> Value {
    json!([
        {
            "moduleId": "history",
            "flowType": "historyNode",
            "inputs": [{"key": "history", "connected": true}],
            "outputs": [
                {"key": "history", "targets": [{"moduleId": "chat", "key": "history"}]}
            ]
        },
        {
            "moduleId": "question",
            "flowType": "questionInput",
            "inputs": [{"key": "userChatInput", "connected": true}],
            "outputs": [
                {"key": "userChatInput", "targets": [
                    {"moduleId": "search", "key": "userChatInput"},
                    {"moduleId": "chat", "key": "userChatInput"}
                ]}
            ]
        },
        {
            "moduleId": "search",
            "flowType": "kbSearchNode",
            "inputs": [
                {"key": "kbList", "value": [{"kbId": kb_id}], "connected": true},
                {"key": "similarity", "value": 0.5, "connected": true},
                {"key": "limit", "value": 3, "connected": true},
                {"key": "userChatInput", "connected": true}
            ],
            "outputs": [
                {"key": "isEmpty", "targets": [{"moduleId": "fallback", "key": "switch"}]},
                {"key": "unEmpty", "targets": [{"moduleId": "chat", "key": "switch"}]},
                {"key": "quoteQA", "targets": [{"moduleId": "chat", "key": "quoteQA"}]}
            ]
        },
        {
            "moduleId": "chat",
            "flowType": "chatNode",
            "inputs": [
                {"key": "switch", "connected": true},
                {"key": "quoteQA", "connected": true},
                {"key": "history", "connected": true},
                {"key": "userChatInput", "connected": true}
            ],
            "outputs": [{"key": "answerText", "targets": []}]
        },
        {
            "moduleId": "fallback",
            "flowType": "answerNode",
            "inputs": [
                {"key": "switch", "connected": true},
                {"key": "text", "value": "Sorry, I don't know.", "connected": true}
            ],
            "outputs": [{"key": "answerText", "targets": []}]
        }
    ])
}

/// Classifier routing each category to its own fixed answer.
pub fn classify_flow() -> Value {
    json!([
        {
            "moduleId": "question",
            "flowType": "questionInput",
            "inputs": [{"key": "userChatInput", "connected": true}],
            "outputs": [
                {"key": "userChatInput", "targets": [{"moduleId": "classify", "key": "userChatInput"}]}
            ]
        },
        {
            "moduleId": "classify",
            "flowType": "classifyQuestion",
            "inputs": [
                {"key": "agents", "value": [
                    {"key": "greeting", "value": "Greetings"},
                    {"key": "other", "value": "Anything else"}
                ], "connected": true},
                {"key": "userChatInput", "connected": true}
            ],
            "outputs": [
                {"key": "greeting", "targets": [{"moduleId": "hello", "key": "switch"}]},
                {"key": "other", "targets": [{"moduleId": "sorry", "key": "switch"}]}
            ]
        },
        {
            "moduleId": "hello",
            "flowType": "answerNode",
            "inputs": [
                {"key": "switch", "connected": true},
                {"key": "text", "value": "Hi there!", "connected": true}
            ],
            "outputs": [{"key": "answerText", "targets": []}]
        },
        {
            "moduleId": "sorry",
            "flowType": "answerNode",
            "inputs": [
                {"key": "switch", "connected": true},
                {"key": "text", "value": "I can only say hello.", "connected": true}
            ],
            "outputs": [{"key": "answerText", "targets": []}]
        }
    ])
}

/// Minimal valid config TOML.
pub fn config_toml() -> &'static str {
    r#"
workspace = "/tmp/flowchat-test"

[model]
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
"#
}
