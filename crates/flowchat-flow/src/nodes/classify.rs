use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use flowchat_core::config::ModelConfig;
use flowchat_core::error::{FlowError, Result};
use flowchat_core::params::NodeParams;
use flowchat_core::traits::{LlmClient, NodeExecutor};
use flowchat_core::types::{ChatMessage, DispatchContext, FlowType, NodeOutput, TraceRecord};

use super::{complete, estimate_tokens, history_param};

const MODULE_NAME: &str = "Classify Question";

/// One branch of a classifier: `key` is the output key, `value` describes
/// the questions it takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyAgent {
    pub key: String,
    pub value: String,
}

/// Routes the question to exactly one output branch chosen by the LLM.
pub struct ClassifyQuestionNode {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl ClassifyQuestionNode {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { llm, model }
    }
}

fn classify_prompt(system_prompt: Option<&str>, agents: &[ClassifyAgent]) -> String {
    let categories = agents
        .iter()
        .map(|agent| format!("- {}: {}", agent.key, agent.value))
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = String::new();
    if let Some(background) = system_prompt.filter(|p| !p.trim().is_empty()) {
        prompt.push_str(background);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Classify the user's question into one of these categories:\n");
    prompt.push_str(&categories);
    prompt.push_str("\n\nRespond with ONLY the category key.");
    prompt
}

/// Match the model reply against agent keys. Exact match first, then the
/// first key mentioned anywhere in the reply, then the last agent.
fn match_agent<'a>(reply: &str, agents: &'a [ClassifyAgent]) -> Option<&'a ClassifyAgent> {
    let reply = reply.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
    agents
        .iter()
        .find(|agent| agent.key == reply)
        .or_else(|| agents.iter().find(|agent| reply.contains(agent.key.as_str())))
        .or_else(|| {
            warn!(reply, "Classifier reply matched no category, using the last one");
            agents.last()
        })
}

impl NodeExecutor for ClassifyQuestionNode {
    fn flow_type(&self) -> FlowType {
        FlowType::ClassifyQuestion
    }

    fn execute(&self, params: NodeParams, _ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let agents: Vec<ClassifyAgent> = params.parse("agents")?.unwrap_or_default();
            if agents.is_empty() {
                return Err(FlowError::node(FlowType::ClassifyQuestion, "no categories configured"));
            }
            let question = params
                .get_str("userChatInput")
                .filter(|q| !q.trim().is_empty())
                .ok_or_else(|| FlowError::node(FlowType::ClassifyQuestion, "question is empty"))?
                .to_string();

            let mut messages = vec![ChatMessage::system(classify_prompt(
                params.get_str("systemPrompt"),
                &agents,
            ))];
            messages.extend(history_param(&params));
            messages.push(ChatMessage::user(question));

            let completion = complete(self.llm.as_ref(), &self.model, messages.clone(), None).await?;
            let tokens = match completion.tokens {
                0 => estimate_tokens(&messages, &completion.text),
                n => n,
            };

            let Some(agent) = match_agent(&completion.text, &agents) else {
                return Err(FlowError::node(FlowType::ClassifyQuestion, "no categories configured"));
            };
            debug!(reply = %completion.text.trim(), category = %agent.key, "Question classified");

            let trace = TraceRecord::new(MODULE_NAME)
                .with_usage(self.model.model_id.clone(), tokens, self.model.price_for(tokens))
                .with_detail("cqList", serde_json::to_value(&agents)?)
                .with_detail("cqResult", json!(agent.value));

            Ok(NodeOutput::new()
                .with_value(agent.key.clone(), json!(true))
                .with_trace(trace))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_test_utils::{ctx, model_config, params, MockLlmClient};

    fn agents() -> serde_json::Value {
        json!([
            {"key": "greeting", "value": "Small talk and greetings"},
            {"key": "product", "value": "Questions about the product"},
            {"key": "other", "value": "Anything else"}
        ])
    }

    async fn classify(reply: &str) -> NodeOutput {
        let llm = Arc::new(MockLlmClient::new().with_reply(reply));
        ClassifyQuestionNode::new(llm, model_config())
            .execute(params(json!({"agents": agents(), "userChatInput": "hello!"})), ctx())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exact_key() {
        let out = classify("greeting").await;
        assert_eq!(out.values.len(), 1);
        assert_eq!(out.values["greeting"], true);
        let trace = out.trace.unwrap();
        assert_eq!(trace.module_name, "Classify Question");
        assert_eq!(trace.extra["cqResult"], "Small talk and greetings");
    }

    #[tokio::test]
    async fn test_key_inside_reply() {
        let out = classify("The category is: product.").await;
        assert_eq!(out.values["product"], true);
    }

    #[tokio::test]
    async fn test_unmatched_falls_back_to_last() {
        let out = classify("no idea").await;
        assert_eq!(out.values["other"], true);
    }

    #[tokio::test]
    async fn test_prompt_lists_categories() {
        let llm = Arc::new(MockLlmClient::new().with_reply("other"));
        ClassifyQuestionNode::new(llm.clone(), model_config())
            .execute(
                params(json!({"agents": agents(), "userChatInput": "q", "systemPrompt": "Shop bot."})),
                ctx(),
            )
            .await
            .unwrap();
        let (_, messages) = llm.requests().pop().unwrap();
        assert!(messages[0].content.starts_with("Shop bot."));
        assert!(messages[0].content.contains("- product: Questions about the product"));
    }

    #[tokio::test]
    async fn test_no_agents_fails() {
        let llm = Arc::new(MockLlmClient::new());
        let err = ClassifyQuestionNode::new(llm, model_config())
            .execute(params(json!({"userChatInput": "q"})), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Node { .. }));
    }
}
