use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};

/// Parameter bag handed to a node executor: the node's bound input values
/// keyed by input key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeParams {
    values: Map<String, Value>,
}

impl NodeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Get a value by key. `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Get a number, accepting numeric strings as authored in flow editors.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Deserialize a value into a typed structure. Absent keys yield `None`.
    pub fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| FlowError::MissingInput(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Get the underlying map.
    pub fn data(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl From<Map<String, Value>> for NodeParams {
    fn from(values: Map<String, Value>) -> Self {
        Self::from_map(values)
    }
}
