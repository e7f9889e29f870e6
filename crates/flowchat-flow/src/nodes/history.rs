use futures::future::BoxFuture;

use flowchat_core::error::Result;
use flowchat_core::params::NodeParams;
use flowchat_core::traits::NodeExecutor;
use flowchat_core::types::{DispatchContext, FlowType, NodeOutput};

use super::history_param;

/// Trims the request history to the last `maxContext` messages.
pub struct HistoryNode {
    default_context: i64,
}

impl HistoryNode {
    pub fn new(default_context: i64) -> Self {
        Self { default_context }
    }
}

impl NodeExecutor for HistoryNode {
    fn flow_type(&self) -> FlowType {
        FlowType::HistoryNode
    }

    fn execute(&self, params: NodeParams, _ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let max_context = params.get_i64("maxContext").unwrap_or(self.default_context);
            let mut history = history_param(&params);

            if max_context <= 0 {
                history.clear();
            } else {
                let keep = max_context as usize;
                if history.len() > keep {
                    history.drain(..history.len() - keep);
                }
            }

            Ok(NodeOutput::new().with_value("history", serde_json::to_value(history)?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_test_utils::{ctx, params};
    use serde_json::{json, Value};

    fn history() -> Value {
        json!([
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "two"},
            {"role": "user", "content": "three"}
        ])
    }

    #[tokio::test]
    async fn test_keeps_last_messages() {
        let node = HistoryNode::new(5);
        let out = node
            .execute(params(json!({"maxContext": 2, "history": history()})), ctx())
            .await
            .unwrap();
        let kept = out.values["history"].as_array().unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["content"], "two");
        assert_eq!(kept[1]["content"], "three");
    }

    #[tokio::test]
    async fn test_zero_context_clears() {
        let node = HistoryNode::new(5);
        let out = node
            .execute(params(json!({"maxContext": 0, "history": history()})), ctx())
            .await
            .unwrap();
        assert_eq!(out.values["history"], json!([]));
    }

    #[tokio::test]
    async fn test_default_context_and_missing_history() {
        let node = HistoryNode::new(1);
        let out = node.execute(params(json!({"history": history()})), ctx()).await.unwrap();
        assert_eq!(out.values["history"].as_array().unwrap().len(), 1);

        let out = node.execute(NodeParams::new(), ctx()).await.unwrap();
        assert_eq!(out.values["history"], json!([]));
        assert!(out.trace.is_none());
    }
}
