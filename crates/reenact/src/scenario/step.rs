//! Recorded browser events.
//!
//! Steps deserialize from the event JSON a page-side tracker emits, so
//! field names follow that wire format (camelCase). Fields the model
//! does not know about are kept in `extra` so templating can still
//! reach them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type as recorded by the tracker. Unrecognized types map to
/// `Unknown` and are skipped at replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Click,
    Mousedown,
    Mousewheel,
    Scroll,
    Keypress,
    Keyup,
    Keydown,
    Script,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn is_keyboard(&self) -> bool {
        matches!(self, EventKind::Keypress | EventKind::Keyup | EventKind::Keydown)
    }
}

/// Where a step runs inside the page's frame tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePath {
    /// Default document, no switching needed.
    Root,
    /// Frame element XPaths, outermost first.
    Xpaths(Vec<String>),
    /// Child-frame indices, outermost first.
    Indices(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedStep {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Locator candidates recorded for the event target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    /// XPath fallback when no locator resolved at record time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,

    #[serde(default)]
    pub alt_key: bool,
    #[serde(default)]
    pub ctrl_key: bool,
    #[serde(default)]
    pub shift_key: bool,
    #[serde(default)]
    pub meta_key: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_y: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iframe_xpaths: Option<Vec<String>>,
    /// Dot-separated child indices, recorded when XPaths were not
    /// available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iframe_indices: Option<String>,

    /// Hook script bodies run around this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    /// Script body for `script` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RecordedStep {
    /// Script steps carry their payload inline; everything else needs
    /// a target to dispatch against.
    pub fn has_target(&self) -> bool {
        self.target.is_some() || self.xpath.is_some()
    }

    pub fn frame_path(&self) -> FramePath {
        if let Some(xpaths) = &self.iframe_xpaths {
            if !xpaths.is_empty() {
                return FramePath::Xpaths(xpaths.clone());
            }
        }
        if let Some(indices) = &self.iframe_indices {
            let parsed: Vec<usize> = indices
                .split('.')
                .filter(|part| !part.is_empty())
                .filter_map(|part| part.parse().ok())
                .collect();
            if !parsed.is_empty() {
                return FramePath::Indices(parsed);
            }
        }
        FramePath::Root
    }
}
