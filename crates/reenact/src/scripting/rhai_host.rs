//! Rhai-backed script host.
//!
//! Scripts compile once into an `Arc<AST>` cached by script id; each
//! evaluation gets a fresh `Scope` built from the JSON bindings.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use serde_json::Value;

use super::{ScriptBindings, ScriptError, ScriptHost};

pub struct RhaiScriptHost {
    engine: Engine,
    cache: RwLock<HashMap<String, Arc<AST>>>,
}

impl RhaiScriptHost {
    pub fn new() -> Self {
        RhaiScriptHost {
            engine: Engine::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn compiled(&self, id: &str, source: &str) -> Result<Arc<AST>, ScriptError> {
        if let Some(ast) = self.cache.read().get(id) {
            return Ok(Arc::clone(ast));
        }
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(id.to_string(), e.to_string()))?;
        let ast = Arc::new(ast);
        self.cache.write().insert(id.to_string(), Arc::clone(&ast));
        Ok(ast)
    }
}

impl Default for RhaiScriptHost {
    fn default() -> Self {
        RhaiScriptHost::new()
    }
}

impl ScriptHost for RhaiScriptHost {
    fn eval(
        &self,
        id: &str,
        source: &str,
        bindings: &ScriptBindings,
    ) -> Result<Value, ScriptError> {
        let ast = self.compiled(id, source)?;
        let mut scope = Scope::new();
        for (name, value) in bindings {
            scope.push_dynamic(name.clone(), json_to_dynamic(value.clone()));
        }
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, ast.as_ref())
            .map_err(|e| ScriptError::Eval(id.to_string(), e.to_string()))?;
        Ok(dynamic_to_json(result))
    }
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        Value::Number(serde_json::Number::from_f64(f).unwrap_or(0.into()))
    } else if let Some(s) = value.clone().try_cast::<String>() {
        Value::String(s)
    } else if let Some(arr) = value.clone().try_cast::<Vec<Dynamic>>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        Value::Object(obj)
    } else {
        Value::String(format!("{value}"))
    }
}
