//! Per-scenario variable store for template expansion.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Keyed string-to-JSON bindings, reset whenever a scenario is
/// (re)loaded. Scripts write into it, templating reads from it.
#[derive(Debug, Default)]
pub struct ReplayContext {
    values: RwLock<HashMap<String, Value>>,
}

impl ReplayContext {
    pub fn new() -> Self {
        ReplayContext::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// String rendering used for `${name}` substitution. JSON strings
    /// render without quotes, everything else as compact JSON.
    pub fn render(&self, key: &str) -> Option<String> {
        self.values.read().get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.read().clone()
    }

    pub fn merge(&self, values: HashMap<String, Value>) {
        self.values.write().extend(values);
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}
