//! Tool-result cache scoped to a single user turn.
//!
//! A fresh [`ToolCache`] is created by the caller (the agent loop) at the
//! start of handling one user message and dropped when that turn ends.
//! It exists so an LLM that re-issues an identical `search_skills("")`
//! across iterations of the same turn gets the cached answer back
//! instead of burning another round-trip.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

fn canonical_key(tool_name: &str, arguments: &Value) -> String {
    // serde_json::Value's Ord for objects is by sorted key, so two
    // differently-ordered-but-equal argument objects produce the same
    // string here.
    format!("{tool_name}:{arguments}")
}

#[derive(Default)]
pub struct ToolCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tool_name: &str, arguments: &Value) -> Option<Value> {
        let key = canonical_key(tool_name, arguments);
        self.entries.lock().unwrap().get(&key).cloned()
    }

    pub fn insert(&self, tool_name: &str, arguments: &Value, result: Value) {
        let key = canonical_key(tool_name, arguments);
        self.entries.lock().unwrap().insert(key, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hits_on_identical_arguments() {
        let cache = ToolCache::new();
        assert!(cache.get("search_skills", &json!({"query": ""})).is_none());

        cache.insert("search_skills", &json!({"query": ""}), json!({"hits": []}));
        assert!(cache.get("search_skills", &json!({"query": ""})).is_some());
    }

    #[test]
    fn key_order_does_not_matter() {
        let cache = ToolCache::new();
        cache.insert(
            "describe_function",
            &json!({"path": "A.b", "extra": 1}),
            json!("doc"),
        );
        assert!(cache
            .get("describe_function", &json!({"extra": 1, "path": "A.b"}))
            .is_some());
    }

    #[test]
    fn misses_on_different_tool() {
        let cache = ToolCache::new();
        cache.insert("search_skills", &json!({"query": "lights"}), json!("a"));
        assert!(cache.get("describe_function", &json!({"query": "lights"})).is_none());
    }
}
