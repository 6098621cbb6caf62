//! Instance context - the JSON map carrying cross-task data
//!
//! Every task's output merges into the instance context; downstream tasks
//! read their inputs from it. Keys prefixed with `_` are engine-internal
//! (pending inputs, child-workflow state) and are excluded when a context
//! is projected into a child workflow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable JSON map carried by a workflow instance
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Context {
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl Context {
    /// Create empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an initial data map
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merge a task's output map into the context (last writer wins)
    pub fn merge(&mut self, data: &Map<String, Value>) {
        for (key, value) in data {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Resolve a dot-separated path (e.g., "applicant.address.street").
    /// Numeric segments index into arrays.
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut value = self.values.get(root)?.clone();

        for segment in parts {
            value = if let Ok(idx) = segment.parse::<usize>() {
                value.get(idx)?.clone()
            } else {
                value.get(segment)?.clone()
            };
        }
        Some(value)
    }

    /// Project the context for a child workflow: engine-internal keys
    /// (leading underscore) are dropped.
    pub fn exportable(&self) -> Map<String, Value> {
        self.values
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Full map view (engine-internal keys included)
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

impl From<Map<String, Value>> for Context {
    fn from(values: Map<String, Value>) -> Self {
        Self::from_map(values)
    }
}

/// Reserved context key holding a pending submitted input for a task
pub fn pending_input_key(task_id: &str) -> String {
    format!("_input_{task_id}")
}

/// Reserved context key holding a child-workflow wait state for a task
pub fn child_state_key(task_id: &str) -> String {
    format!("_child_{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_and_merge() {
        let mut ctx = Context::new();
        ctx.set("k", json!(1));
        assert_eq!(ctx.get("k"), Some(&json!(1)));

        let mut out = Map::new();
        out.insert("k".into(), json!(2));
        out.insert("name".into(), json!("Ada"));
        ctx.merge(&out);

        assert_eq!(ctx.get("k"), Some(&json!(2)));
        assert_eq!(ctx.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn resolve_nested_path() {
        let mut ctx = Context::new();
        ctx.set(
            "applicant",
            json!({"address": {"street": "Calle Mayor"}, "phones": ["111", "222"]}),
        );

        assert_eq!(
            ctx.resolve_path("applicant.address.street").unwrap(),
            json!("Calle Mayor")
        );
        assert_eq!(ctx.resolve_path("applicant.phones.1").unwrap(), json!("222"));
        assert!(ctx.resolve_path("applicant.missing").is_none());
        assert!(ctx.resolve_path("nothing").is_none());
    }

    #[test]
    fn exportable_drops_internal_keys() {
        let mut ctx = Context::new();
        ctx.set("visible", json!(true));
        ctx.set(pending_input_key("review_form"), json!({"name": "Ada"}));
        ctx.set(child_state_key("start_audit"), json!({"child_instance_id": "x"}));

        let exported = ctx.exportable();
        assert_eq!(exported.len(), 1);
        assert!(exported.contains_key("visible"));
    }

    #[test]
    fn serializes_flat() {
        let mut ctx = Context::new();
        ctx.set("a", json!(1));
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, json!({"a": 1}));

        let back: Context = serde_json::from_value(value).unwrap();
        assert_eq!(back.get("a"), Some(&json!(1)));
    }
}
