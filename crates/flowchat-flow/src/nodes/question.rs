use futures::future::BoxFuture;

use flowchat_core::error::Result;
use flowchat_core::params::NodeParams;
use flowchat_core::traits::NodeExecutor;
use flowchat_core::types::{DispatchContext, FlowType, NodeOutput};

/// Passes the user's question through to downstream modules.
pub struct QuestionInputNode;

impl NodeExecutor for QuestionInputNode {
    fn flow_type(&self) -> FlowType {
        FlowType::QuestionInput
    }

    fn execute(&self, params: NodeParams, _ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let mut output = NodeOutput::new();
            if let Some(question) = params.data().get("userChatInput") {
                output = output.with_value("userChatInput", question.clone());
            }
            Ok(output)
        })
    }
}
