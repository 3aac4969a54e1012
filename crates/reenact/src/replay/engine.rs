//! Step execution and the run loop.
//!
//! One engine instance drives one experiment run. Steps execute
//! strictly in order; the control channel is observed only between
//! steps, so a dispatched step always completes (or locally errors)
//! before the run transitions away from playing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::driver::{BrowserDriver, DispatchEvent, DriverPool};
use super::template;
use crate::config::ScriptsConfig;
use crate::playback::Experiment;
use crate::scenario::{EventKind, Scenario};
use crate::scripting::{truthy, ScriptBindings, ScriptError, ScriptHost};
use crate::storage::{ExperimentRepository, ScreenshotStore};

/// Value carried on the control channel. `Run` is the initial state;
/// pause and terminate are one-way per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Terminate,
}

/// How a run ended. Everything that is not an unknown error lands
/// here; unknown errors propagate as `EngineError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached the upper bound.
    Done,
    Paused,
    Terminated,
    /// A browser-side failure escalated by policy.
    ErrorInBrowser(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step data could not be processed: {0}")]
    Data(String),

    #[error("script step failed: {0}")]
    Script(#[from] ScriptError),
}

/// Step-scoped failures. Browser and hook-script errors stay inside
/// the run; `ScriptStep` and `Data` end it.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("{0}")]
    Browser(String),

    #[error(transparent)]
    Script(#[from] ScriptError),

    /// A failing `script`-type step body; the step has no other payload.
    #[error(transparent)]
    ScriptStep(ScriptError),

    #[error("{0}")]
    Data(String),
}

pub struct ReplayEngine {
    driver_pool: Arc<dyn DriverPool>,
    scripts: Arc<dyn ScriptHost>,
    hooks: ScriptsConfig,
    experiments: Arc<dyn ExperimentRepository>,
    screenshots: Arc<dyn ScreenshotStore>,
    settle_timeout: Duration,
    stop_on_browser_error: bool,
}

impl ReplayEngine {
    pub fn new(
        driver_pool: Arc<dyn DriverPool>,
        scripts: Arc<dyn ScriptHost>,
        hooks: ScriptsConfig,
        experiments: Arc<dyn ExperimentRepository>,
        screenshots: Arc<dyn ScreenshotStore>,
        settle_timeout: Duration,
        stop_on_browser_error: bool,
    ) -> Self {
        ReplayEngine {
            driver_pool,
            scripts,
            hooks,
            experiments,
            screenshots,
            settle_timeout,
            stop_on_browser_error,
        }
    }

    /// Executes steps from the experiment's position up to its limit
    /// (exclusive; 0 means the scenario end). The cursor rests at the
    /// upper bound afterwards, never wrapping around.
    pub async fn run(
        &self,
        experiment: &Experiment,
        scenario: &mut Scenario,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<RunOutcome, EngineError> {
        let upper = if experiment.limit > 0 {
            experiment.limit.min(scenario.len())
        } else {
            scenario.len()
        };
        scenario.set_position(experiment.position);
        info!(
            experiment = %experiment.id,
            from = experiment.position,
            to = upper,
            "replay run starting"
        );

        while scenario.position() < upper {
            match *control.borrow() {
                ControlSignal::Pause => return Ok(RunOutcome::Paused),
                ControlSignal::Terminate => return Ok(RunOutcome::Terminated),
                ControlSignal::Run => {}
            }

            let position = scenario.position();
            match self.apply_step(experiment, scenario, position).await {
                Ok(()) => {}
                Err(StepError::Browser(message)) => {
                    warn!(experiment = %experiment.id, step = position, "browser error: {}", message);
                    if self.stop_on_browser_error {
                        return Ok(RunOutcome::ErrorInBrowser(message));
                    }
                }
                Err(StepError::Script(error)) => {
                    warn!(experiment = %experiment.id, step = position, "hook script failed: {}", error);
                }
                Err(StepError::ScriptStep(error)) => {
                    return Err(EngineError::Script(error));
                }
                Err(StepError::Data(message)) => {
                    return Err(EngineError::Data(message));
                }
            }

            scenario.advance();
            self.persist_position(experiment, scenario.position());
        }

        Ok(RunOutcome::Done)
    }

    /// One step, start to finish. Skips (unresolved templates,
    /// duplicates, unknown types, missing targets) return `Ok`; real
    /// failures return a step-scoped error.
    async fn apply_step(
        &self,
        experiment: &Experiment,
        scenario: &mut Scenario,
        position: usize,
    ) -> Result<(), StepError> {
        let Some(step) = scenario.step_at(position) else {
            return Ok(());
        };
        let mut step = step.clone();

        // Publish the step, then give the URL-rewrite hook first say.
        let step_json = serde_json::to_value(&step).map_err(|e| StepError::Data(e.to_string()))?;
        scenario.context().set("step", step_json);

        if let Some(rewrite) = &self.hooks.url_rewrite {
            let bindings = self.step_bindings(&step, scenario)?;
            match self.scripts.eval("url_rewrite", rewrite, &bindings)? {
                Value::String(url) => step.url = Some(url),
                Value::Null => {}
                other => {
                    warn!(step = position, "url rewrite returned a non-string, ignoring: {other}");
                }
            }
        }

        if let Some(pre) = step.pre.clone() {
            let bindings = self.step_bindings(&step, scenario)?;
            let result =
                self.scripts
                    .eval(&format!("step-{}-pre", step.event_id), &pre, &bindings)?;
            merge_into_context(scenario, result);
        }

        let expanded = template::expand_step(&step, scenario.context())
            .map_err(|e| StepError::Data(e.to_string()))?;
        if !expanded.unresolved.is_empty() {
            info!(
                step = position,
                placeholders = ?expanded.unresolved,
                "skipping step with unresolved placeholders"
            );
            return Ok(());
        }
        step = expanded.step;

        if let (Some(script), Some(tag)) = (&self.hooks.duplicate_check, &step.tag) {
            if let Some(previous) = scenario.previous_by_tag(tag) {
                let bindings = ScriptBindings::from([
                    (
                        "current".to_string(),
                        serde_json::to_value(&step).map_err(|e| StepError::Data(e.to_string()))?,
                    ),
                    (
                        "previous".to_string(),
                        serde_json::to_value(previous)
                            .map_err(|e| StepError::Data(e.to_string()))?,
                    ),
                ]);
                if self.scripts.eval_bool("duplicate_check", script, &bindings)? {
                    debug!(step = position, tag = %tag, "skipping duplicate step");
                    return Ok(());
                }
            }
        }

        match step.kind {
            EventKind::Unknown => {
                warn!(step = position, "unsupported event type, skipping");
                return Ok(());
            }
            EventKind::Script => {}
            _ if !step.has_target() => {
                warn!(step = position, "step has no target, skipping");
                return Ok(());
            }
            _ => {}
        }

        if step.kind == EventKind::Script {
            let Some(body) = step.script.clone() else {
                warn!(step = position, "script step without a body, skipping");
                return Ok(());
            };
            let bindings = self.step_bindings(&step, scenario)?;
            let result = self
                .scripts
                .eval(&format!("step-{}-script", step.event_id), &body, &bindings)
                .map_err(StepError::ScriptStep)?;
            merge_into_context(scenario, result);
            return Ok(());
        }

        let driver = self
            .driver_pool
            .acquire(experiment.id)
            .await
            .map_err(|e| StepError::Browser(e.to_string()))?;

        let result = self.run_in_browser(driver.as_ref(), &step).await;
        let errored = result.is_err();

        if !errored {
            if let Some(post) = step.post.clone() {
                match self.step_bindings(&step, scenario).and_then(|bindings| {
                    self.scripts
                        .eval(&format!("step-{}-post", step.event_id), &post, &bindings)
                        .map_err(StepError::Script)
                }) {
                    Ok(result) => merge_into_context(scenario, result),
                    Err(error) => {
                        warn!(step = position, "post hook failed: {}", error);
                    }
                }
            }
            scenario.set_step(position, step.clone());
            scenario.record_last(&step);
        }

        if experiment.screenshots {
            match driver.screenshot().await {
                Ok(bytes) => {
                    if let Err(error) =
                        self.screenshots.save(experiment.id, position, errored, &bytes)
                    {
                        warn!(step = position, "could not store screenshot: {}", error);
                    }
                }
                Err(error) => {
                    warn!(step = position, "screenshot failed: {}", error);
                }
            }
        }
        self.driver_pool.release(experiment.id, driver).await;

        result
    }

    async fn run_in_browser(
        &self,
        driver: &dyn BrowserDriver,
        step: &crate::scenario::RecordedStep,
    ) -> Result<(), StepError> {
        if let Some(url) = &step.url {
            driver
                .open(url)
                .await
                .map_err(|e| StepError::Browser(e.to_string()))?;
        }
        driver
            .wait_settled(self.settle_timeout)
            .await
            .map_err(|e| StepError::Browser(e.to_string()))?;
        driver
            .switch_frames(&step.frame_path())
            .await
            .map_err(|e| StepError::Browser(e.to_string()))?;
        driver
            .dispatch(&DispatchEvent::from_step(step))
            .await
            .map_err(|e| StepError::Browser(e.to_string()))?;
        driver
            .wait_settled(self.settle_timeout)
            .await
            .map_err(|e| StepError::Browser(e.to_string()))?;

        if let Some(probe) = &self.hooks.page_error_probe {
            let reported = driver
                .eval_in_page(probe)
                .await
                .map_err(|e| StepError::Browser(e.to_string()))?;
            if truthy(&reported) {
                return Err(StepError::Browser(format!(
                    "page reported an error: {reported}"
                )));
            }
        }
        Ok(())
    }

    fn step_bindings(
        &self,
        step: &crate::scenario::RecordedStep,
        scenario: &Scenario,
    ) -> Result<ScriptBindings, StepError> {
        let step_json = serde_json::to_value(step).map_err(|e| StepError::Data(e.to_string()))?;
        let context_json = Value::Object(
            scenario
                .context()
                .snapshot()
                .into_iter()
                .collect::<serde_json::Map<_, _>>(),
        );
        Ok(ScriptBindings::from([
            ("step".to_string(), step_json),
            ("context".to_string(), context_json),
        ]))
    }

    fn persist_position(&self, experiment: &Experiment, position: usize) {
        let mut record = experiment.clone();
        record.position = position;
        if let Err(error) = self.experiments.update(&record) {
            warn!(experiment = %experiment.id, "could not persist step progress: {}", error);
        }
    }
}

/// Hooks that return an object merge it into the replay context; any
/// other result is discarded.
fn merge_into_context(scenario: &Scenario, result: Value) {
    if let Value::Object(map) = result {
        scenario.context().merge(map.into_iter().collect());
    }
}
