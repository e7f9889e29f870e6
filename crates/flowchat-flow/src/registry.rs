use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use flowchat_core::error::Result;
use flowchat_core::params::NodeParams;
use flowchat_core::traits::NodeExecutor;
use flowchat_core::types::{DispatchContext, FlowType, NodeOutput};

use crate::nodes::{self, BuiltinDeps};

/// Registry of node executors keyed by node kind.
pub struct ExecutorRegistry {
    executors: HashMap<FlowType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same kind.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        self.executors.insert(executor.flow_type(), Arc::new(executor));
    }

    /// Unregister the executor for a kind.
    pub fn unregister(&mut self, flow_type: &FlowType) -> bool {
        self.executors.remove(flow_type).is_some()
    }

    /// Get the executor for a kind.
    pub fn get(&self, flow_type: &FlowType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(flow_type).cloned()
    }

    /// List registered kinds.
    pub fn list(&self) -> Vec<&FlowType> {
        self.executors.keys().collect()
    }

    /// Start executing a node of the given kind.
    ///
    /// Kinds without an executor resolve to an empty output so flows
    /// authored for newer node kinds still run.
    pub fn invoke(
        &self,
        flow_type: &FlowType,
        params: NodeParams,
        ctx: DispatchContext,
    ) -> BoxFuture<'static, Result<NodeOutput>> {
        match self.get(flow_type) {
            Some(executor) => Box::pin(async move { executor.execute(params, ctx).await }),
            None => {
                debug!(flow_type = %flow_type, "No executor registered, passing through");
                Box::pin(async { Ok(NodeOutput::default()) })
            }
        }
    }

    /// Create a registry with all built-in node executors registered.
    pub fn with_builtins(deps: BuiltinDeps) -> Self {
        let mut registry = Self::new();

        registry.register(nodes::history::HistoryNode::new(deps.history_context));
        registry.register(nodes::question::QuestionInputNode);
        registry.register(nodes::answer::AnswerNode);
        registry.register(nodes::chat::ChatNode::new(deps.llm.clone(), deps.model.clone()));
        registry.register(nodes::classify::ClassifyQuestionNode::new(
            deps.llm,
            deps.model,
        ));
        registry.register(nodes::kb_search::KbSearchNode::new(
            deps.embeddings,
            deps.knowledge_base,
        ));

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
