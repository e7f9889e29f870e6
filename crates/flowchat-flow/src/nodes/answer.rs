use futures::future::BoxFuture;
use serde_json::Value;

use flowchat_core::error::Result;
use flowchat_core::params::NodeParams;
use flowchat_core::traits::NodeExecutor;
use flowchat_core::types::{DispatchContext, FlowType, NodeOutput, StreamEvent, ANSWER_TEXT_KEY};

/// Emits fixed or upstream text as part of the answer.
pub struct AnswerNode;

impl NodeExecutor for AnswerNode {
    fn flow_type(&self) -> FlowType {
        FlowType::AnswerNode
    }

    fn execute(&self, params: NodeParams, ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let text = match params.get("text") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => serde_json::to_string_pretty(other)?,
                None => String::new(),
            };

            if ctx.stream && !text.is_empty() {
                ctx.transport.send(StreamEvent::Answer(text.clone()));
            }

            Ok(NodeOutput::new().with_value(ANSWER_TEXT_KEY, Value::String(text)))
        })
    }
}
