use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Request errors
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Dispatch produced an empty answer; check the flow wiring")]
    EmptyAnswer,

    // Node errors
    #[error("Node {flow_type} failed: {message}")]
    Node { flow_type: String, message: String },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    // Retrieval errors
    #[error("Embedding request failed: {0}")]
    Embedding(String),

    #[error("Knowledge base error: {0}")]
    KnowledgeBase(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Build a node execution error tagged with the failing node kind.
    pub fn node(flow_type: impl ToString, message: impl Into<String>) -> Self {
        Self::Node {
            flow_type: flow_type.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
