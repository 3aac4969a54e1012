//! Hook script configuration.
//!
//! Every hook is optional. Bodies are Rhai source; what each hook is bound
//! with is documented on the replay engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScriptsConfig {
    /// Rewrites a step's URL before templating. Bound with `step` and `context`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_rewrite: Option<String>,

    /// Decides whether `current` repeats `previous` (same tag). A true
    /// result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_check: Option<String>,

    /// JavaScript evaluated in the page by the driver to probe for an
    /// application error indicator. A non-empty result is the error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_error_probe: Option<String>,

    /// Runs once over the freshly loaded step list; may rewrite it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process_scenario: Option<String>,
}
