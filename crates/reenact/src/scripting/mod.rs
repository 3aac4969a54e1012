//! User-script hooks.
//!
//! Hooks run inline at step boundaries, so the host interface is
//! synchronous. Bindings go in as JSON values and results come back as
//! JSON, keeping callers independent of the script engine.

mod rhai_host;

pub use rhai_host::RhaiScriptHost;

use std::collections::HashMap;

use serde_json::Value;

pub type ScriptBindings = HashMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script '{0}' failed to compile: {1}")]
    Compile(String, String),

    #[error("script '{0}' failed: {1}")]
    Eval(String, String),

    #[error("script binding error: {0}")]
    Binding(String),
}

/// Evaluates named script sources against a set of bindings. `id`
/// identifies the script for compilation caching and error messages;
/// callers keep it stable for a stable source.
pub trait ScriptHost: Send + Sync {
    fn eval(&self, id: &str, source: &str, bindings: &ScriptBindings)
        -> Result<Value, ScriptError>;

    fn eval_bool(
        &self,
        id: &str,
        source: &str,
        bindings: &ScriptBindings,
    ) -> Result<bool, ScriptError> {
        Ok(truthy(&self.eval(id, source, bindings)?))
    }
}

/// Truthiness for predicate hooks: null and false are false, zero and
/// the empty string are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Used when no scripting is configured: every hook answers null,
/// every predicate answers false.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpScriptHost;

impl ScriptHost for NoOpScriptHost {
    fn eval(
        &self,
        _id: &str,
        _source: &str,
        _bindings: &ScriptBindings,
    ) -> Result<Value, ScriptError> {
        Ok(Value::Null)
    }
}
