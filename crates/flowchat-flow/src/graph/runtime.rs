use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tracing::warn;

use flowchat_core::params::NodeParams;
use flowchat_core::types::{FlowType, ANSWER_TEXT_KEY};

use super::interpolate::interpolate_value;
use super::module::{EdgeTarget, ModuleDefinition};

/// A gating input slot. `None` means not yet bound.
#[derive(Debug, Clone)]
pub struct RuntimeInput {
    pub key: String,
    pub value: Option<Value>,
}

/// An output slot with its outgoing edges.
#[derive(Debug, Clone)]
pub struct RuntimeOutput {
    pub key: String,
    /// Values of this output are appended to the answer text.
    pub answer: bool,
    pub value: Option<Value>,
    pub targets: Vec<EdgeTarget>,
}

/// Per-request state of one module.
#[derive(Debug)]
pub struct RuntimeNode {
    pub module_id: String,
    pub flow_type: FlowType,
    pub inputs: Vec<RuntimeInput>,
    pub outputs: Vec<RuntimeOutput>,
    dispatched: AtomicBool,
}

impl RuntimeNode {
    /// Bind `value` to input `key`.
    ///
    /// Returns false when the node has no such input or has already been
    /// dispatched; the binding is dropped in both cases.
    pub fn bind(&mut self, key: &str, value: Value) -> bool {
        if self.is_dispatched() {
            return false;
        }
        match self.inputs.iter_mut().find(|input| input.key == key) {
            Some(input) => {
                input.value = Some(value);
                true
            }
            None => false,
        }
    }

    /// Ready once every gating input holds a value.
    pub fn is_ready(&self) -> bool {
        self.inputs.iter().all(|input| input.value.is_some())
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Claim the node for execution. Only the first caller gets `true`.
    pub fn claim(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bound input values as an executor parameter bag.
    pub fn params(&self) -> NodeParams {
        let values: Map<String, Value> = self
            .inputs
            .iter()
            .filter_map(|input| input.value.clone().map(|v| (input.key.clone(), v)))
            .collect();
        NodeParams::from_map(values)
    }
}

impl RuntimeOutput {
    /// Store a produced value. Returns false if one was already stored;
    /// the first write wins.
    pub fn store(&mut self, value: &Value) -> bool {
        if self.value.is_some() {
            return false;
        }
        self.value = Some(value.clone());
        true
    }
}

/// The runtime graph of one request.
#[derive(Debug, Default)]
pub struct RuntimeGraph {
    nodes: Vec<RuntimeNode>,
    index: HashMap<String, usize>,
}

impl RuntimeGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RuntimeNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &RuntimeNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut RuntimeNode {
        &mut self.nodes[idx]
    }

    /// Look up a node by module id.
    pub fn find(&self, module_id: &str) -> Option<usize> {
        self.index.get(module_id).copied()
    }

    /// Indices of nodes that receive the request parameters.
    pub fn entry_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.flow_type.is_entry())
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Build the runtime graph for one request.
///
/// Unconnected inputs are dropped, string inputs are interpolated against
/// `variables`, and outputs keyed `answerText` are flagged as answer-bearing.
/// Edges are not validated here; targets that don't exist are skipped
/// during propagation.
pub fn load_modules(modules: &[ModuleDefinition], variables: &Map<String, Value>) -> RuntimeGraph {
    let mut graph = RuntimeGraph::default();

    for module in modules {
        let node = RuntimeNode {
            module_id: module.module_id.clone(),
            flow_type: module.flow_type.clone(),
            inputs: module
                .inputs
                .iter()
                .filter(|input| input.connected)
                .map(|input| RuntimeInput {
                    key: input.key.clone(),
                    value: input
                        .value
                        .clone()
                        .map(|value| interpolate_value(value, variables)),
                })
                .collect(),
            outputs: module
                .outputs
                .iter()
                .map(|output| RuntimeOutput {
                    key: output.key.clone(),
                    answer: output.key == ANSWER_TEXT_KEY,
                    value: None,
                    targets: output.targets.clone(),
                })
                .collect(),
            dispatched: AtomicBool::new(false),
        };

        let idx = graph.nodes.len();
        if graph.index.contains_key(&node.module_id) {
            warn!(module_id = %node.module_id, "Duplicate module id, later definition is unreachable by edges");
        } else {
            graph.index.insert(node.module_id.clone(), idx);
        }
        graph.nodes.push(node);
    }

    graph
}
