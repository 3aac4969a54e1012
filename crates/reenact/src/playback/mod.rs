//! Experiment lifecycle over recorded scenarios.
//!
//! An experiment is one playback attempt of a stored recording. The
//! controller runs many of them concurrently, each on its own spawned
//! task with its own browser instance, and owns the pause, resume and
//! cancel transitions.
//!
//! # Module Structure
//!
//! - `controller`: concurrent start/pause/resume/cancel orchestration
//! - `experiment`: persistent experiment record and status
//! - `notify`: completion event fan-out

pub mod controller;
pub mod experiment;
pub mod notify;

pub use controller::{ControllerDeps, PlaybackController};
pub use experiment::{Experiment, ExperimentStatus};
#[allow(unused_imports)]
pub use notify::{LogNotifier, Notifier, PlaybackEvent};

use thiserror::Error;
use uuid::Uuid;

use crate::capture::CaptureError;
use crate::scripting::ScriptError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("experiment {0} is not playing")]
    NotPlaying(Uuid),

    #[error("experiment {0} is already playing")]
    AlreadyPlaying(Uuid),

    #[error("experiment {0} has already completed")]
    Completed(Uuid),

    #[error("position {0} is outside the scenario (0..={1})")]
    OutOfBounds(usize, usize),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}
