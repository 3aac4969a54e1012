//! Deterministic replay of recorded scenarios.
//!
//! # Module Structure
//!
//! - `engine` - per-step algorithm and the run loop
//! - `driver` - browser driver and pool boundary
//! - `template` - `${name}` expansion against the replay context

mod driver;
mod engine;
mod template;

pub use driver::{BrowserDriver, DispatchEvent, DriverError, DriverPool, KeyPress};
pub use engine::{ControlSignal, EngineError, ReplayEngine, RunOutcome};
#[allow(unused_imports)]
pub use template::{expand_step, expand_string, Expanded};
