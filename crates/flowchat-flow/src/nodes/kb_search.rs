use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::params::NodeParams;
use flowchat_core::traits::{EmbeddingProvider, KnowledgeBase, NodeExecutor};
use flowchat_core::types::{DispatchContext, FlowType, NodeOutput, TraceRecord};

const MODULE_NAME: &str = "KB Search";
const DEFAULT_SIMILARITY: f64 = 0.8;
const DEFAULT_LIMIT: i64 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectedKb {
    kb_id: String,
}

/// Vector search over the selected knowledge bases.
pub struct KbSearchNode {
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    knowledge_base: Option<Arc<dyn KnowledgeBase>>,
}

impl KbSearchNode {
    pub fn new(
        embeddings: Option<Arc<dyn EmbeddingProvider>>,
        knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    ) -> Self {
        Self {
            embeddings,
            knowledge_base,
        }
    }
}

fn fail(message: impl Into<String>) -> FlowError {
    FlowError::node(FlowType::KbSearchNode, message)
}

impl NodeExecutor for KbSearchNode {
    fn flow_type(&self) -> FlowType {
        FlowType::KbSearchNode
    }

    fn execute(&self, params: NodeParams, _ctx: DispatchContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let kb_list: Vec<SelectedKb> = params.parse("kbList")?.unwrap_or_default();
            if kb_list.is_empty() {
                return Err(fail("no knowledge base selected"));
            }
            let question = params
                .get_str("userChatInput")
                .filter(|q| !q.trim().is_empty())
                .ok_or_else(|| fail("input is empty"))?
                .to_string();

            let (Some(embeddings), Some(knowledge_base)) = (&self.embeddings, &self.knowledge_base)
            else {
                return Err(fail("knowledge base search is not configured"));
            };

            let similarity = params.get_f64("similarity").unwrap_or(DEFAULT_SIMILARITY);
            let limit = params.get_i64("limit").unwrap_or(DEFAULT_LIMIT).max(0) as usize;
            let kb_ids: Vec<String> = kb_list.into_iter().map(|kb| kb.kb_id).collect();

            let embedded = embeddings.embed(vec![question]).await?;
            let vector = embedded
                .vectors
                .first()
                .ok_or_else(|| FlowError::Embedding("provider returned no vectors".into()))?;

            let quotes = knowledge_base
                .search(&kb_ids, vector, similarity as f32, limit)
                .await?;

            debug!(
                kbs = kb_ids.len(),
                found = quotes.len(),
                similarity,
                limit,
                "Knowledge base searched"
            );

            let price = embedded.tokens as f64 / 1000.0 * embeddings.price_per_1k();
            let trace = TraceRecord::new(MODULE_NAME)
                .with_usage(embeddings.model(), embedded.tokens, price)
                .with_detail("similarity", json!(similarity))
                .with_detail("limit", json!(limit));

            let mut output = NodeOutput::new();
            if quotes.is_empty() {
                output = output.with_value("isEmpty", json!(true));
            } else {
                output = output.with_value("unEmpty", json!(true));
            }
            Ok(output
                .with_value("quoteQA", serde_json::to_value(&quotes)?)
                .with_trace(trace))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::types::QuoteItem;
    use flowchat_test_utils::{ctx, params, MockEmbeddings, StaticKnowledgeBase};

    fn quote(kb: &str, id: &str, vector: Vec<f32>) -> (QuoteItem, Vec<f32>) {
        (
            QuoteItem {
                kb_id: kb.into(),
                id: id.into(),
                q: format!("question {id}"),
                a: format!("answer {id}"),
                source: String::new(),
            },
            vector,
        )
    }

    fn node(kb: StaticKnowledgeBase) -> KbSearchNode {
        KbSearchNode::new(
            Some(Arc::new(MockEmbeddings::new(vec![1.0, 0.0]).with_tokens(8).with_price(0.5))),
            Some(Arc::new(kb)),
        )
    }

    #[tokio::test]
    async fn test_found_quotes_set_unempty() {
        let kb = StaticKnowledgeBase::new(vec![
            quote("kb1", "a", vec![1.0, 0.0]),
            quote("kb2", "b", vec![1.0, 0.0]),
            quote("kb1", "c", vec![0.0, 1.0]),
        ]);
        let out = node(kb)
            .execute(
                params(json!({"kbList": [{"kbId": "kb1"}], "userChatInput": "rust?", "similarity": 0.5})),
                ctx(),
            )
            .await
            .unwrap();

        assert_eq!(out.values["unEmpty"], true);
        assert!(!out.values.contains_key("isEmpty"));
        let quotes = out.values["quoteQA"].as_array().unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0]["id"], "a");

        let trace = out.trace.unwrap();
        assert_eq!(trace.module_name, "KB Search");
        assert_eq!(trace.tokens, 8);
        assert!((trace.price - 0.004).abs() < 1e-9);
        assert_eq!(trace.extra["limit"], 5);
    }

    #[tokio::test]
    async fn test_nothing_found_sets_is_empty() {
        let kb = StaticKnowledgeBase::new(vec![quote("kb1", "c", vec![0.0, 1.0])]);
        let out = node(kb)
            .execute(params(json!({"kbList": [{"kbId": "kb1"}], "userChatInput": "rust?"})), ctx())
            .await
            .unwrap();
        assert_eq!(out.values["isEmpty"], true);
        assert!(!out.values.contains_key("unEmpty"));
        assert_eq!(out.values["quoteQA"], json!([]));
    }

    #[tokio::test]
    async fn test_requires_kb_list_and_input() {
        let search = node(StaticKnowledgeBase::new(Vec::new()));
        let err = search
            .execute(params(json!({"kbList": [], "userChatInput": "q"})), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no knowledge base selected"));

        let err = search
            .execute(params(json!({"kbList": [{"kbId": "kb1"}], "userChatInput": ""})), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input is empty"));
    }

    #[tokio::test]
    async fn test_unconfigured_fails() {
        let search = KbSearchNode::new(None, None);
        let err = search
            .execute(params(json!({"kbList": [{"kbId": "kb1"}], "userChatInput": "q"})), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
