//! Recorded scenarios: browser-event steps, cursor bookkeeping and the
//! per-scenario replay context.
//!
//! # Module Structure
//!
//! - `step` - the recorded browser-event model
//! - `context` - variable store for template expansion

mod context;
mod step;

pub use context::ReplayContext;
pub use step::{EventKind, FramePath, RecordedStep};

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::scripting::{ScriptError, ScriptHost};

/// Ordered step sequence with replay bookkeeping. One instance per
/// run; nothing here is shared across scenarios.
pub struct Scenario {
    recording_id: String,
    steps: Vec<RecordedStep>,
    position: usize,
    /// Most recent step seen per tag, scoped to this scenario.
    last_by_tag: HashMap<String, RecordedStep>,
    context: ReplayContext,
}

impl Scenario {
    pub fn new(recording_id: impl Into<String>, steps: Vec<RecordedStep>) -> Self {
        Scenario {
            recording_id: recording_id.into(),
            steps,
            position: 0,
            last_by_tag: HashMap::new(),
            context: ReplayContext::new(),
        }
    }

    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Caller keeps `position <= len()`; the run loop treats it as the
    /// next step to execute.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn step_at(&self, position: usize) -> Option<&RecordedStep> {
        self.steps.get(position)
    }

    pub fn current(&self) -> Option<&RecordedStep> {
        self.steps.get(self.position)
    }

    /// Moves to the next position, saturating at the step count. No
    /// wraparound.
    pub fn advance(&mut self) {
        if self.position < self.steps.len() {
            self.position += 1;
        }
    }

    /// Persists a (possibly mutated) step back into the sequence.
    pub fn set_step(&mut self, position: usize, step: RecordedStep) {
        if position < self.steps.len() {
            self.steps[position] = step;
        }
    }

    pub fn record_last(&mut self, step: &RecordedStep) {
        if let Some(tag) = &step.tag {
            self.last_by_tag.insert(tag.clone(), step.clone());
        }
    }

    pub fn previous_by_tag(&self, tag: &str) -> Option<&RecordedStep> {
        self.last_by_tag.get(tag)
    }

    pub fn context(&self) -> &ReplayContext {
        &self.context
    }

    /// Recorded wall-clock span, last step timestamp minus first.
    pub fn duration(&self) -> chrono::Duration {
        match (self.steps.first(), self.steps.last()) {
            (Some(first), Some(last)) => {
                chrono::Duration::milliseconds(last.timestamp - first.timestamp)
            }
            _ => chrono::Duration::zero(),
        }
    }

    /// Runs the scenario-level rewrite script over the freshly loaded
    /// step list. The script sees `steps` as a JSON array and returns
    /// the replacement array; a non-array result keeps the steps
    /// unchanged with a warning. Script failures are fatal here, not
    /// step-scoped.
    pub fn post_process(
        &mut self,
        host: &dyn ScriptHost,
        script: &str,
    ) -> Result<(), ScriptError> {
        let steps_json = serde_json::to_value(&self.steps)
            .map_err(|e| ScriptError::Binding(e.to_string()))?;
        let bindings = HashMap::from([("steps".to_string(), steps_json)]);
        let result = host.eval("post_process_scenario", script, &bindings)?;
        match result {
            Value::Array(_) => {
                self.steps = serde_json::from_value(result)
                    .map_err(|e| ScriptError::Binding(e.to_string()))?;
                self.position = 0;
                Ok(())
            }
            Value::Null => Ok(()),
            other => {
                warn!(
                    recording = %self.recording_id,
                    "post-process script returned {}, keeping steps unchanged",
                    json_kind(&other)
                );
                Ok(())
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
