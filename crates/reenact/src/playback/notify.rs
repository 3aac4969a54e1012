//! Completion notifications.

use serde::Serialize;
use tracing::{error, info, warn};

use super::experiment::Experiment;

/// What a finished run is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackEvent {
    Done,
    Paused,
    Terminated,
    ErrorInBrowser,
    UnknownError,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, experiment: &Experiment, event: PlaybackEvent);
}

/// Default subscriber: structured log lines. Pause and terminate are
/// expected interruptions, never logged as errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, experiment: &Experiment, event: PlaybackEvent) {
        let id = experiment.id;
        let position = experiment.position;
        match event {
            PlaybackEvent::Done => {
                info!(experiment = %id, position, "experiment finished");
            }
            PlaybackEvent::Paused | PlaybackEvent::Terminated => {
                info!(experiment = %id, position, event = ?event, "experiment interrupted");
            }
            PlaybackEvent::ErrorInBrowser => {
                warn!(
                    experiment = %id,
                    position,
                    message = experiment.error_message.as_deref().unwrap_or(""),
                    "experiment paused on a browser error"
                );
            }
            PlaybackEvent::UnknownError => {
                error!(
                    experiment = %id,
                    position,
                    message = experiment.error_message.as_deref().unwrap_or(""),
                    "experiment failed"
                );
            }
        }
    }
}
