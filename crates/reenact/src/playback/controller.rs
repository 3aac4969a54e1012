//! Concurrent experiment execution.
//!
//! Each experiment runs as one spawned task; registries keyed by
//! experiment id hold its control sender while playing and its last
//! seen URL across pause/resume. Driver instances are retained by the
//! pool across pauses and discarded on completion or cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::experiment::{Experiment, ExperimentStatus};
use super::notify::{Notifier, PlaybackEvent};
use super::PlaybackError;
use crate::capture::CaptureService;
use crate::config::{PlaybackConfig, ScriptsConfig};
use crate::replay::{ControlSignal, DriverPool, ReplayEngine, RunOutcome};
use crate::scenario::Scenario;
use crate::scripting::ScriptHost;
use crate::storage::{ExperimentRepository, RecordingRepository, ScreenshotStore};

struct RunningHandle {
    control: watch::Sender<ControlSignal>,
}

/// External collaborators the controller runs against.
pub struct ControllerDeps {
    pub recordings: Arc<dyn RecordingRepository>,
    pub experiments: Arc<dyn ExperimentRepository>,
    pub screenshots: Arc<dyn ScreenshotStore>,
    pub driver_pool: Arc<dyn DriverPool>,
    pub script_host: Arc<dyn ScriptHost>,
    pub notifier: Arc<dyn Notifier>,
    /// Wired when capture-on-replay is enabled for the deployment.
    pub capture: Option<Arc<CaptureService>>,
}

pub struct PlaybackController {
    playback: PlaybackConfig,
    scripts: ScriptsConfig,
    deps: ControllerDeps,
    running: Arc<RwLock<HashMap<Uuid, RunningHandle>>>,
    last_urls: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl PlaybackController {
    pub fn new(playback: PlaybackConfig, scripts: ScriptsConfig, deps: ControllerDeps) -> Self {
        PlaybackController {
            playback,
            scripts,
            deps,
            running: Arc::new(RwLock::new(HashMap::new())),
            last_urls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates an experiment over a stored recording and, unless
    /// `paused`, immediately resumes it.
    pub async fn start(
        &self,
        recording_id: &str,
        with_screenshots: bool,
        paused: bool,
    ) -> Result<Experiment, PlaybackError> {
        let steps = self.deps.recordings.get(recording_id)?;
        let experiment = Experiment::new(
            recording_id,
            self.playback.start_step,
            self.playback.finish_step,
            steps.len(),
            with_screenshots,
        );
        self.deps.experiments.create(&experiment)?;
        info!(experiment = %experiment.id, recording = %recording_id, "experiment created");

        if paused {
            return Ok(experiment);
        }
        self.resume(experiment.id).await?;
        Ok(self.deps.experiments.get(experiment.id)?)
    }

    /// Marks the experiment playing and launches its run task. The
    /// completion handler at the end of the task interprets the
    /// outcome, persists the experiment and notifies subscribers.
    pub async fn resume(&self, experiment_id: Uuid) -> Result<(), PlaybackError> {
        if self.running.read().contains_key(&experiment_id) {
            return Err(PlaybackError::AlreadyPlaying(experiment_id));
        }
        let mut experiment = self.deps.experiments.get(experiment_id)?;
        if experiment.status.is_terminal() {
            return Err(PlaybackError::Completed(experiment_id));
        }

        let steps = self.deps.recordings.get(&experiment.recording_id)?;
        let mut scenario = Scenario::new(experiment.recording_id.clone(), steps);
        if let Some(script) = &self.scripts.post_process_scenario {
            // Fatal here, not step-scoped: a broken rewrite would
            // replay a scenario the operator never recorded.
            scenario.post_process(self.deps.script_host.as_ref(), script)?;
        }

        let companion = if self.playback.capture_on_replay.enabled {
            match &self.deps.capture {
                Some(service) => {
                    service.start(&experiment_id.to_string()).await?;
                    true
                }
                None => {
                    warn!(
                        experiment = %experiment_id,
                        "capture on replay enabled but no capture service is wired"
                    );
                    false
                }
            }
        } else {
            false
        };

        experiment.status = ExperimentStatus::Playing;
        experiment.error_message = None;
        self.deps.experiments.update(&experiment)?;

        let engine = ReplayEngine::new(
            Arc::clone(&self.deps.driver_pool),
            Arc::clone(&self.deps.script_host),
            self.scripts.clone(),
            Arc::clone(&self.deps.experiments),
            Arc::clone(&self.deps.screenshots),
            Duration::from_millis(self.playback.step_settle_timeout_ms),
            self.playback.stop_on_browser_error,
        );

        let (control_tx, mut control_rx) = watch::channel(ControlSignal::Run);
        self.running
            .write()
            .insert(experiment_id, RunningHandle { control: control_tx });

        let running = Arc::clone(&self.running);
        let last_urls = Arc::clone(&self.last_urls);
        let experiments = Arc::clone(&self.deps.experiments);
        let driver_pool = Arc::clone(&self.deps.driver_pool);
        let notifier = Arc::clone(&self.deps.notifier);
        let capture = self.deps.capture.clone();

        tokio::spawn(async move {
            let outcome = engine.run(&experiment, &mut scenario, &mut control_rx).await;
            running.write().remove(&experiment_id);

            if companion {
                if let Some(service) = &capture {
                    if let Err(error) = service.stop(&experiment_id.to_string()) {
                        warn!(experiment = %experiment_id, "companion capture did not stop cleanly: {}", error);
                    }
                }
            }

            let final_position = scenario.position();
            let last_url = final_position
                .checked_sub(1)
                .and_then(|position| scenario.step_at(position))
                .and_then(|step| step.url.clone());

            let mut record = match experiments.get(experiment_id) {
                Ok(record) => record,
                Err(error) => {
                    error!(experiment = %experiment_id, "experiment vanished mid-run: {}", error);
                    return;
                }
            };
            record.position = final_position;

            let event = match outcome {
                Ok(RunOutcome::Done) => {
                    record.status = ExperimentStatus::Finished;
                    driver_pool.discard(experiment_id).await;
                    last_urls.write().remove(&experiment_id);
                    PlaybackEvent::Done
                }
                Ok(RunOutcome::Paused) => {
                    record.status = ExperimentStatus::Paused;
                    if let Some(url) = last_url {
                        last_urls.write().insert(experiment_id, url);
                    }
                    PlaybackEvent::Paused
                }
                Ok(RunOutcome::Terminated) => {
                    record.status = ExperimentStatus::Finished;
                    driver_pool.discard(experiment_id).await;
                    last_urls.write().remove(&experiment_id);
                    PlaybackEvent::Terminated
                }
                Ok(RunOutcome::ErrorInBrowser(message)) => {
                    record.status = ExperimentStatus::Paused;
                    record.error_message = Some(message);
                    if let Some(url) = last_url {
                        last_urls.write().insert(experiment_id, url);
                    }
                    PlaybackEvent::ErrorInBrowser
                }
                Err(error) => {
                    record.status = ExperimentStatus::Errored;
                    record.error_message = Some(error.to_string());
                    driver_pool.discard(experiment_id).await;
                    last_urls.write().remove(&experiment_id);
                    PlaybackEvent::UnknownError
                }
            };

            if let Err(error) = experiments.update(&record) {
                error!(experiment = %experiment_id, "could not persist final state: {}", error);
            }
            notifier.notify(&record, event);
        });

        Ok(())
    }

    /// Signals the running task to pause at the next step boundary.
    pub fn pause(&self, experiment_id: Uuid) -> Result<(), PlaybackError> {
        self.signal(experiment_id, ControlSignal::Pause)
    }

    /// Signals the running task to stop; the experiment completes as
    /// finished and its retained state is discarded.
    pub fn cancel(&self, experiment_id: Uuid) -> Result<(), PlaybackError> {
        self.signal(experiment_id, ControlSignal::Terminate)
    }

    fn signal(&self, experiment_id: Uuid, signal: ControlSignal) -> Result<(), PlaybackError> {
        let running = self.running.read();
        let handle = running
            .get(&experiment_id)
            .ok_or(PlaybackError::NotPlaying(experiment_id))?;
        handle
            .control
            .send(signal)
            .map_err(|_| PlaybackError::NotPlaying(experiment_id))
    }

    pub fn status(&self, experiment_id: Uuid) -> Result<Experiment, PlaybackError> {
        Ok(self.deps.experiments.get(experiment_id)?)
    }

    /// Repositions a non-playing experiment's cursor.
    pub fn move_cursor(&self, experiment_id: Uuid, position: usize) -> Result<(), PlaybackError> {
        let mut experiment = self.deps.experiments.get(experiment_id)?;
        if experiment.status == ExperimentStatus::Playing
            || self.running.read().contains_key(&experiment_id)
        {
            return Err(PlaybackError::AlreadyPlaying(experiment_id));
        }
        if position > experiment.steps {
            return Err(PlaybackError::OutOfBounds(position, experiment.steps));
        }
        experiment.position = position;
        self.deps.experiments.update(&experiment)?;
        Ok(())
    }

    pub fn experiments(&self) -> Vec<Experiment> {
        self.deps.experiments.list()
    }

    pub fn screenshot(
        &self,
        experiment_id: Uuid,
        position: usize,
    ) -> Result<Vec<u8>, PlaybackError> {
        Ok(self.deps.screenshots.open(experiment_id, position)?)
    }

    pub fn is_playing(&self, experiment_id: Uuid) -> bool {
        self.running.read().contains_key(&experiment_id)
    }

    /// Last URL a paused experiment saw; cleared on completion.
    pub fn last_url(&self, experiment_id: Uuid) -> Option<String> {
        self.last_urls.read().get(&experiment_id).cloned()
    }
}
