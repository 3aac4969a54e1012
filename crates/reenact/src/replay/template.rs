//! `${name}` expansion over recorded steps.
//!
//! Every string-valued field of a step, nested fields and the extra
//! bag included, is expanded against the scenario's replay context.
//! Placeholders that stay unresolved make the step unexecutable; the
//! engine skips such steps.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::scenario::{RecordedStep, ReplayContext};

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").unwrap())
}

/// An expanded step plus the placeholder names that had no binding.
pub struct Expanded {
    pub step: RecordedStep,
    pub unresolved: Vec<String>,
}

/// Expands one string. Unresolved placeholders are left in place and
/// reported.
pub fn expand_string(input: &str, context: &ReplayContext) -> (String, Vec<String>) {
    let mut unresolved = Vec::new();
    let expanded = placeholder_regex()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match context.render(name) {
                Some(value) => value,
                None => {
                    unresolved.push(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    (expanded, unresolved)
}

/// Expands every string field of a step through a JSON round trip, so
/// nested locators and unknown tracker fields are covered too.
pub fn expand_step(
    step: &RecordedStep,
    context: &ReplayContext,
) -> Result<Expanded, serde_json::Error> {
    let mut value = serde_json::to_value(step)?;
    let mut unresolved = Vec::new();
    expand_value(&mut value, context, &mut unresolved);
    let step = serde_json::from_value(value)?;
    unresolved.sort();
    unresolved.dedup();
    Ok(Expanded { step, unresolved })
}

fn expand_value(value: &mut Value, context: &ReplayContext, unresolved: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let (expanded, mut missing) = expand_string(s, context);
            *s = expanded;
            unresolved.append(&mut missing);
        }
        Value::Array(items) => {
            for item in items {
                expand_value(item, context, unresolved);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_value(item, context, unresolved);
            }
        }
        _ => {}
    }
}
