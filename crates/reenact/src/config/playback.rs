//! Playback-side configuration: step bounds, screenshots, companion capture.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    /// First step position to execute.
    #[serde(default)]
    pub start_step: usize,

    /// Upper bound, exclusive. 0 plays to the end of the scenario.
    #[serde(default)]
    pub finish_step: usize,

    /// How long the driver may take to report the page settled after an action.
    #[serde(default = "default_step_settle_timeout_ms")]
    pub step_settle_timeout_ms: u64,

    /// Escalate an in-page error to a run outcome instead of logging and
    /// continuing with the next step.
    #[serde(default)]
    pub stop_on_browser_error: bool,

    #[serde(default)]
    pub screenshots: ScreenshotConfig,

    #[serde(default)]
    pub capture_on_replay: CaptureOnReplayConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_step: 0,
            finish_step: 0,
            step_settle_timeout_ms: default_step_settle_timeout_ms(),
            stop_on_browser_error: false,
            screenshots: ScreenshotConfig::default(),
            capture_on_replay: CaptureOnReplayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScreenshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_screenshot_dir")]
    pub dir: PathBuf,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_screenshot_dir(),
        }
    }
}

/// Run a recording session alongside a replay so the replay itself
/// produces fresh artifacts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptureOnReplayConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_step_settle_timeout_ms() -> u64 {
    30_000
}

fn default_screenshot_dir() -> PathBuf {
    PathBuf::from("screenshots")
}
