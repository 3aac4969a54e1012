//! Browser driver boundary.
//!
//! The engine owns scheduling and error interpretation; the driver
//! owns actual browser control. Implementations live outside this
//! crate, tests use scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::scenario::{EventKind, FramePath, RecordedStep};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("page did not settle within {0:?}")]
    SettleTimeout(Duration),

    #[error("frame switch failed: {0}")]
    Frame(String),

    #[error("in-page script failed: {0}")]
    PageScript(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),
}

/// Key payload with the modifier flags the tracker recorded. `code`
/// is the character code, falling back to the key code when the
/// character code was zero or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub code: u32,
    pub alt: bool,
    pub ctrl: bool,
    pub shift: bool,
    pub meta: bool,
}

/// Type-specific payload handed to `dispatch`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub kind: EventKind,
    /// Locator candidates as recorded.
    pub target: Option<Value>,
    pub xpath: Option<String>,
    pub button: Option<i64>,
    pub key: Option<KeyPress>,
    pub delta_y: Option<f64>,
}

impl DispatchEvent {
    pub fn from_step(step: &RecordedStep) -> Self {
        let key = step.kind.is_keyboard().then(|| KeyPress {
            code: step
                .char_code
                .filter(|code| *code != 0)
                .or(step.key_code)
                .unwrap_or(0),
            alt: step.alt_key,
            ctrl: step.ctrl_key,
            shift: step.shift_key,
            meta: step.meta_key,
        });
        DispatchEvent {
            kind: step.kind,
            target: step.target.clone(),
            xpath: step.xpath.clone(),
            button: step.button,
            key,
            delta_y: step.delta_y,
        }
    }
}

/// One live browser instance.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, url: &str) -> Result<(), DriverError>;

    /// Waits for asynchronous page activity to quiesce, bounded by
    /// `timeout`.
    async fn wait_settled(&self, timeout: Duration) -> Result<(), DriverError>;

    async fn switch_frames(&self, path: &FramePath) -> Result<(), DriverError>;

    async fn dispatch(&self, event: &DispatchEvent) -> Result<(), DriverError>;

    /// Evaluates JavaScript in the page and returns its JSON result.
    async fn eval_in_page(&self, script: &str) -> Result<Value, DriverError>;

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;
}

/// Hands out browser instances per experiment. A paused experiment
/// keeps its instance; `discard` ends it.
#[async_trait]
pub trait DriverPool: Send + Sync {
    /// Returns the experiment's retained instance, or a fresh one.
    async fn acquire(&self, experiment: Uuid) -> Result<std::sync::Arc<dyn BrowserDriver>, DriverError>;

    /// Returns the instance after a step. The pool keeps it bound to
    /// the experiment so the next acquire sees the same browser state.
    async fn release(&self, experiment: Uuid, driver: std::sync::Arc<dyn BrowserDriver>);

    /// Drops whatever the experiment holds. Called on completion and
    /// cancel, not on pause.
    async fn discard(&self, experiment: Uuid);
}
