//! Semantic Tracker (C10, second half): walks ordered snapshot records,
//! extracting named fields via pure selectors and summarizing changes
//! between consecutive snapshots. Purely observational — never mutates the
//! pipeline, never aborts a request.

use serde_json::Value;

use crate::snapshot_writer::SnapshotRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct TraceNode {
    pub stage: String,
    pub node_id: String,
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone)]
pub struct ChangeDescriptor {
    pub spec_id: String,
    pub stage: String,
    pub previous: Option<Value>,
    pub current: Option<Value>,
    pub description: String,
}

/// A pure function extracting one named field from a snapshot payload.
pub type Selector = fn(&Value) -> Option<Value>;

pub struct NamedSelector {
    pub name: &'static str,
    pub selector: Selector,
}

fn select_path(payload: &Value, path: &[&str]) -> Option<Value> {
    let mut current = payload;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

pub fn messages_by_role(payload: &Value) -> Option<Value> {
    let messages = payload.get("messages")?.as_array()?;
    let mut by_role = serde_json::Map::new();
    for m in messages {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("unknown");
        by_role
            .entry(role.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .unwrap()
            .push(m.clone());
    }
    Some(Value::Object(by_role))
}

pub fn tool_calls(payload: &Value) -> Option<Value> {
    select_path(payload, &["tool_calls"]).or_else(|| select_path(payload, &["message", "tool_calls"]))
}

pub fn tools_list(payload: &Value) -> Option<Value> {
    select_path(payload, &["tools"])
}

pub fn primary_content(payload: &Value) -> Option<Value> {
    select_path(payload, &["content"]).or_else(|| select_path(payload, &["message", "content"]))
}

pub fn route_target(payload: &Value) -> Option<Value> {
    select_path(payload, &["route", "target"])
}

pub fn model_id(payload: &Value) -> Option<Value> {
    select_path(payload, &["model"])
}

pub fn usage(payload: &Value) -> Option<Value> {
    select_path(payload, &["usage"])
}

/// Registry of named selectors/summaries used when walking a snapshot
/// sequence. Registered by name so callers can opt into a subset.
pub struct SemanticTracker {
    selectors: Vec<NamedSelector>,
}

impl Default for SemanticTracker {
    fn default() -> Self {
        Self::with_builtin_selectors()
    }
}

impl SemanticTracker {
    pub fn new() -> Self {
        Self { selectors: Vec::new() }
    }

    pub fn with_builtin_selectors() -> Self {
        let mut tracker = Self::new();
        tracker.register("messages_by_role", messages_by_role);
        tracker.register("tool_calls", tool_calls);
        tracker.register("tools_list", tools_list);
        tracker.register("primary_content", primary_content);
        tracker.register("route_target", route_target);
        tracker.register("model_id", model_id);
        tracker.register("usage", usage);
        tracker
    }

    pub fn register(&mut self, name: &'static str, selector: Selector) {
        self.selectors.push(NamedSelector { name, selector });
    }

    /// Extracts all registered fields for one snapshot record into a
    /// `TraceNode`.
    pub fn trace_node(&self, record: &SnapshotRecord) -> TraceNode {
        let values = self
            .selectors
            .iter()
            .filter_map(|s| {
                (s.selector)(&record.payload).map(|v| FieldValue {
                    name: s.name.to_string(),
                    value: v,
                })
            })
            .collect();
        TraceNode {
            stage: record.phase.as_str().to_string(),
            node_id: record.request_id.clone(),
            values,
        }
    }

    /// Walks an ordered snapshot sequence, emitting a trace and a list of
    /// per-field changes between consecutive snapshots.
    pub fn walk(&self, records: &[SnapshotRecord]) -> (Vec<TraceNode>, Vec<ChangeDescriptor>) {
        let mut trace = Vec::with_capacity(records.len());
        let mut changes = Vec::new();
        let mut previous: Option<TraceNode> = None;

        for record in records {
            let node = self.trace_node(record);
            if let Some(prev) = &previous {
                for field in &node.values {
                    let prev_value = prev.values.iter().find(|f| f.name == field.name);
                    let differs = match prev_value {
                        Some(pv) => pv.value != field.value,
                        None => true,
                    };
                    if differs {
                        changes.push(ChangeDescriptor {
                            spec_id: field.name.clone(),
                            stage: node.stage.clone(),
                            previous: prev_value.map(|f| f.value.clone()),
                            current: Some(field.value.clone()),
                            description: format!(
                                "{} changed entering stage {}",
                                field.name, node.stage
                            ),
                        });
                    }
                }
            }
            previous = Some(node.clone());
            trace.push(node);
        }

        (trace, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::EntryTag;
    use crate::snapshot_writer::SnapshotPhase;

    fn record(phase: SnapshotPhase, model: &str) -> SnapshotRecord {
        SnapshotRecord::new(
            phase,
            "req-1",
            EntryTag::OpenAIChat,
            serde_json::json!({"model": model, "messages": [{"role": "user", "content": "hi"}]}),
            serde_json::json!({}),
        )
    }

    #[test]
    fn extracts_model_and_messages_by_role() {
        let tracker = SemanticTracker::with_builtin_selectors();
        let node = tracker.trace_node(&record(SnapshotPhase::ClientRequest, "gpt-4o"));
        let model = node.values.iter().find(|f| f.name == "model_id").unwrap();
        assert_eq!(model.value, serde_json::json!("gpt-4o"));
    }

    #[test]
    fn walk_detects_model_change_between_snapshots() {
        let tracker = SemanticTracker::with_builtin_selectors();
        let records = vec![
            record(SnapshotPhase::ClientRequest, "gpt-4o"),
            record(SnapshotPhase::ProviderRequest, "gpt-4o-mini"),
        ];
        let (trace, changes) = tracker.walk(&records);
        assert_eq!(trace.len(), 2);
        assert!(changes.iter().any(|c| c.spec_id == "model_id"));
    }
}
