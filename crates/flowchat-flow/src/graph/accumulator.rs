use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowchat_core::types::TraceRecord;

/// Final payload of one dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub answer_text: String,
    pub response_data: Vec<TraceRecord>,
}

/// Collects traces and answer text in completion order.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    answer_text: String,
    trace: Vec<TraceRecord>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_trace(&mut self, record: TraceRecord) {
        self.trace.push(record);
    }

    /// Append an answer-bearing value.
    pub fn push_answer(&mut self, value: &Value) {
        match value {
            Value::String(s) => self.answer_text.push_str(s),
            Value::Null => {}
            other => self.answer_text.push_str(&other.to_string()),
        }
    }

    pub fn answer_text(&self) -> &str {
        &self.answer_text
    }

    pub fn trace(&self) -> &[TraceRecord] {
        &self.trace
    }

    pub fn finish(self) -> DispatchOutcome {
        DispatchOutcome {
            answer_text: self.answer_text,
            response_data: self.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_answer_concatenated_in_push_order() {
        let mut acc = ResultAccumulator::new();
        acc.push_answer(&json!("Hello, "));
        acc.push_answer(&json!("world"));
        acc.push_answer(&json!(42));
        acc.push_answer(&Value::Null);
        assert_eq!(acc.answer_text(), "Hello, world42");
    }

    #[test]
    fn test_finish_keeps_trace_order() {
        let mut acc = ResultAccumulator::new();
        acc.push_trace(TraceRecord::new("KB Search"));
        acc.push_trace(TraceRecord::new("AI Chat"));
        let outcome = acc.finish();
        assert_eq!(outcome.answer_text, "");
        let names: Vec<_> = outcome
            .response_data
            .iter()
            .map(|r| r.module_name.as_str())
            .collect();
        assert_eq!(names, vec!["KB Search", "AI Chat"]);
    }
}
