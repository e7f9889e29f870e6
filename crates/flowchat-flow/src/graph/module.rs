use serde::{Deserialize, Deserializer, Serialize};

use flowchat_core::types::FlowType;

/// A module (node) of an authored flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefinition {
    /// Unique identifier within the flow.
    pub module_id: String,
    /// Node kind.
    pub flow_type: FlowType,
    #[serde(default)]
    pub inputs: Vec<ModuleInput>,
    #[serde(default)]
    pub outputs: Vec<ModuleOutput>,
}

/// An input slot of a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInput {
    pub key: String,
    /// Static value set in the flow editor. May contain `{{variable}}` tokens.
    /// An authored `null` is a value; only an absent key leaves the input unset.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<serde_json::Value>,
    /// Whether this input takes part in the runtime graph.
    #[serde(default)]
    pub connected: bool,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// An output of a module with the edges leaving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub key: String,
    #[serde(default)]
    pub targets: Vec<EdgeTarget>,
}

/// Edge endpoint: the input `key` of module `module_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTarget {
    pub module_id: String,
    pub key: String,
}

/// A stored chat app: its identity and flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

impl ModuleDefinition {
    /// Create a module with no inputs or outputs.
    pub fn new(module_id: impl Into<String>, flow_type: impl Into<FlowType>) -> Self {
        Self {
            module_id: module_id.into(),
            flow_type: flow_type.into(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    /// Add a connected input that must be bound by an edge or by seeding.
    pub fn with_input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(ModuleInput {
            key: key.into(),
            value: None,
            connected: true,
        });
        self
    }

    /// Add a connected input with a static value.
    pub fn with_static_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.push(ModuleInput {
            key: key.into(),
            value: Some(value),
            connected: true,
        });
        self
    }

    /// Add an input that is not connected.
    pub fn with_unconnected_input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(ModuleInput {
            key: key.into(),
            value: None,
            connected: false,
        });
        self
    }

    /// Add an output with the given edges, each `(module_id, input_key)`.
    pub fn with_output(mut self, key: impl Into<String>, targets: &[(&str, &str)]) -> Self {
        self.outputs.push(ModuleOutput {
            key: key.into(),
            targets: targets
                .iter()
                .map(|(module_id, key)| EdgeTarget {
                    module_id: module_id.to_string(),
                    key: key.to_string(),
                })
                .collect(),
        });
        self
    }
}
