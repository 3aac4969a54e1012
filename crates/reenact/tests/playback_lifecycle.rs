//! Playback lifecycle tests.
//!
//! These drive the controller's real spawned-task machinery against
//! scripted driver fakes. Dispatches block on a semaphore so each test
//! decides exactly how far a run proceeds before pausing or cancelling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use reenact::config::{PlaybackConfig, ScriptsConfig};
use reenact::playback::{
    ControllerDeps, Experiment, ExperimentStatus, Notifier, PlaybackController, PlaybackError,
    PlaybackEvent,
};
use reenact::replay::{BrowserDriver, DispatchEvent, DriverError, DriverPool};
use reenact::scenario::{FramePath, RecordedStep};
use reenact::scripting::RhaiScriptHost;
use reenact::storage::{
    InMemoryExperimentRepository, InMemoryRecordingRepository, InMemoryScreenshotStore,
    RecordingRepository,
};

const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Driver whose dispatches park on a shared gate. Every dispatch first
/// reports its ordinal, so tests know when a run is inside a step.
struct GateDriver {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<usize>,
    fail: Arc<AtomicBool>,
    dispatched: AtomicUsize,
    opened: Mutex<Vec<String>>,
}

#[async_trait]
impl BrowserDriver for GateDriver {
    async fn open(&self, url: &str) -> Result<(), DriverError> {
        self.opened.lock().push(url.to_string());
        Ok(())
    }

    async fn wait_settled(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn switch_frames(&self, _path: &FramePath) -> Result<(), DriverError> {
        Ok(())
    }

    async fn dispatch(&self, _event: &DispatchEvent) -> Result<(), DriverError> {
        let ordinal = self.dispatched.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.send(ordinal);
        self.gate
            .acquire()
            .await
            .expect("dispatch gate closed")
            .forget();
        if self.fail.load(Ordering::SeqCst) {
            return Err(DriverError::ElementNotFound("#pay".to_string()));
        }
        Ok(())
    }

    async fn eval_in_page(&self, _script: &str) -> Result<Value, DriverError> {
        Ok(Value::Null)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![1])
    }
}

/// Pool with the production retention contract: an experiment keeps
/// its instance across release and loses it on discard.
struct RetainingPool {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<usize>,
    fail_dispatch: Arc<AtomicBool>,
    held: Mutex<HashMap<Uuid, Arc<GateDriver>>>,
    all_created: Mutex<Vec<Arc<GateDriver>>>,
    discards: AtomicUsize,
}

impl RetainingPool {
    fn new(gate: Arc<Semaphore>, entered: mpsc::UnboundedSender<usize>) -> Self {
        RetainingPool {
            gate,
            entered,
            fail_dispatch: Arc::new(AtomicBool::new(false)),
            held: Mutex::new(HashMap::new()),
            all_created: Mutex::new(Vec::new()),
            discards: AtomicUsize::new(0),
        }
    }

    fn driver_of(&self, experiment: Uuid) -> Option<Arc<GateDriver>> {
        self.held.lock().get(&experiment).cloned()
    }
}

#[async_trait]
impl DriverPool for RetainingPool {
    async fn acquire(&self, experiment: Uuid) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        let driver = {
            let mut held = self.held.lock();
            match held.get(&experiment) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let fresh = Arc::new(GateDriver {
                        gate: Arc::clone(&self.gate),
                        entered: self.entered.clone(),
                        fail: Arc::clone(&self.fail_dispatch),
                        dispatched: AtomicUsize::new(0),
                        opened: Mutex::new(Vec::new()),
                    });
                    held.insert(experiment, Arc::clone(&fresh));
                    self.all_created.lock().push(Arc::clone(&fresh));
                    fresh
                }
            }
        };
        Ok(driver as Arc<dyn BrowserDriver>)
    }

    async fn release(&self, _experiment: Uuid, _driver: Arc<dyn BrowserDriver>) {}

    async fn discard(&self, experiment: Uuid) {
        self.discards.fetch_add(1, Ordering::SeqCst);
        self.held.lock().remove(&experiment);
    }
}

/// Forwards completion events into a channel the test can await.
struct ChannelNotifier {
    events: mpsc::UnboundedSender<(Uuid, PlaybackEvent, ExperimentStatus)>,
}

impl Notifier for ChannelNotifier {
    fn notify(&self, experiment: &Experiment, event: PlaybackEvent) {
        let _ = self.events.send((experiment.id, event, experiment.status));
    }
}

struct TestBed {
    controller: PlaybackController,
    pool: Arc<RetainingPool>,
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedReceiver<usize>,
    events: mpsc::UnboundedReceiver<(Uuid, PlaybackEvent, ExperimentStatus)>,
}

/// Builds a controller over one stored recording named `journey`.
fn test_bed(steps: Vec<RecordedStep>, playback: PlaybackConfig, scripts: ScriptsConfig) -> TestBed {
    let recordings = Arc::new(InMemoryRecordingRepository::new());
    recordings.put("journey", steps);

    let gate = Arc::new(Semaphore::new(0));
    let (entered_tx, entered_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(RetainingPool::new(Arc::clone(&gate), entered_tx));
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let deps = ControllerDeps {
        recordings,
        experiments: Arc::new(InMemoryExperimentRepository::new()),
        screenshots: Arc::new(InMemoryScreenshotStore::new()),
        driver_pool: Arc::clone(&pool) as Arc<dyn DriverPool>,
        script_host: Arc::new(RhaiScriptHost::new()),
        notifier: Arc::new(ChannelNotifier { events: event_tx }),
        capture: None,
    };
    TestBed {
        controller: PlaybackController::new(playback, scripts, deps),
        pool,
        gate,
        entered: entered_rx,
        events: event_rx,
    }
}

async fn next_dispatch(entered: &mut mpsc::UnboundedReceiver<usize>) -> usize {
    tokio::time::timeout(EVENT_WAIT, entered.recv())
        .await
        .expect("timed out waiting for a dispatch")
        .expect("driver channel closed")
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<(Uuid, PlaybackEvent, ExperimentStatus)>,
) -> (Uuid, PlaybackEvent, ExperimentStatus) {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for a playback event")
        .expect("notifier channel closed")
}

fn step(json: Value) -> RecordedStep {
    serde_json::from_value(json).unwrap()
}

fn click(event_id: u64, url: &str) -> RecordedStep {
    step(json!({
        "type": "click",
        "eventId": event_id,
        "url": url,
        "target": [{"getText": "#go"}],
    }))
}

// =============================================================================
// Pause / resume / cancel
// =============================================================================

#[tokio::test]
async fn test_pause_retains_driver_and_resume_continues() {
    let steps = (0..3)
        .map(|i| click(i, &format!("https://shop.example.test/s{i}")))
        .collect();
    let mut bed = test_bed(steps, PlaybackConfig::default(), ScriptsConfig::default());

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let id = experiment.id;
    assert_eq!(experiment.status, ExperimentStatus::Playing);
    assert!(bed.controller.is_playing(id));

    // Let step 0 through, then wait until the run is parked inside
    // step 1's dispatch, past the control check.
    bed.gate.add_permits(1);
    assert_eq!(next_dispatch(&mut bed.entered).await, 0);
    assert_eq!(next_dispatch(&mut bed.entered).await, 1);

    bed.controller.pause(id).unwrap();
    bed.gate.add_permits(1);

    let (event_id, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event_id, id);
    assert_eq!(event, PlaybackEvent::Paused);
    assert_eq!(status, ExperimentStatus::Paused);

    // The signalled step completed before the run stopped.
    let paused = bed.controller.status(id).unwrap();
    assert_eq!(paused.status, ExperimentStatus::Paused);
    assert_eq!(paused.position, 2);
    assert!(!bed.controller.is_playing(id));
    assert_eq!(
        bed.controller.last_url(id).as_deref(),
        Some("https://shop.example.test/s1")
    );
    // The browser stays bound to the experiment while paused.
    assert_eq!(bed.pool.all_created.lock().len(), 1);
    assert!(bed.pool.driver_of(id).is_some());

    bed.controller.resume(id).await.unwrap();
    bed.gate.add_permits(1);
    // Ordinal 2 on the same driver instance: the run continued from
    // the paused cursor with the retained browser.
    assert_eq!(next_dispatch(&mut bed.entered).await, 2);

    let (_, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::Done);
    assert_eq!(status, ExperimentStatus::Finished);

    let finished = bed.controller.status(id).unwrap();
    assert_eq!(finished.position, 3);
    assert!(finished.error_message.is_none());
    assert_eq!(bed.controller.last_url(id), None);
    assert_eq!(bed.pool.all_created.lock().len(), 1);
    assert_eq!(bed.pool.discards.load(Ordering::SeqCst), 1);
    assert!(bed.pool.driver_of(id).is_none());
}

#[tokio::test]
async fn test_cancel_finishes_and_discards() {
    let steps = (0..3).map(|i| click(i, "https://shop.example.test/")).collect();
    let mut bed = test_bed(steps, PlaybackConfig::default(), ScriptsConfig::default());

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let id = experiment.id;

    assert_eq!(next_dispatch(&mut bed.entered).await, 0);
    bed.controller.cancel(id).unwrap();
    bed.gate.add_permits(1);

    let (_, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::Terminated);
    assert_eq!(status, ExperimentStatus::Finished);

    let cancelled = bed.controller.status(id).unwrap();
    assert_eq!(cancelled.status, ExperimentStatus::Finished);
    assert_eq!(cancelled.position, 1);
    assert_eq!(bed.pool.discards.load(Ordering::SeqCst), 1);
    assert!(bed.pool.driver_of(id).is_none());

    assert!(matches!(
        bed.controller.resume(id).await,
        Err(PlaybackError::Completed(_))
    ));
}

#[tokio::test]
async fn test_signals_require_a_running_experiment() {
    let bed = test_bed(
        vec![click(0, "https://a.example.test/")],
        PlaybackConfig::default(),
        ScriptsConfig::default(),
    );
    let experiment = bed.controller.start("journey", false, true).await.unwrap();
    assert_eq!(experiment.status, ExperimentStatus::Created);

    assert!(matches!(
        bed.controller.pause(experiment.id),
        Err(PlaybackError::NotPlaying(_))
    ));
    assert!(matches!(
        bed.controller.cancel(experiment.id),
        Err(PlaybackError::NotPlaying(_))
    ));
    assert!(matches!(
        bed.controller.pause(Uuid::new_v4()),
        Err(PlaybackError::NotPlaying(_))
    ));
}

#[tokio::test]
async fn test_move_cursor_only_when_not_playing() {
    let steps = (0..4).map(|i| click(i, "https://a.example.test/")).collect();
    let mut bed = test_bed(steps, PlaybackConfig::default(), ScriptsConfig::default());
    let experiment = bed.controller.start("journey", false, true).await.unwrap();
    let id = experiment.id;

    // A parked experiment can be repositioned anywhere in 0..=steps.
    bed.controller.move_cursor(id, 4).unwrap();
    assert_eq!(bed.controller.status(id).unwrap().position, 4);
    assert!(matches!(
        bed.controller.move_cursor(id, 5),
        Err(PlaybackError::OutOfBounds(5, 4))
    ));
    bed.controller.move_cursor(id, 1).unwrap();

    bed.controller.resume(id).await.unwrap();
    assert_eq!(next_dispatch(&mut bed.entered).await, 0);
    assert!(matches!(
        bed.controller.move_cursor(id, 0),
        Err(PlaybackError::AlreadyPlaying(_))
    ));
    assert!(matches!(
        bed.controller.resume(id).await,
        Err(PlaybackError::AlreadyPlaying(_))
    ));

    bed.controller.cancel(id).unwrap();
    bed.gate.add_permits(1);
    let (_, event, _) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::Terminated);
}

// =============================================================================
// Error handling
// =============================================================================

#[tokio::test]
async fn test_browser_error_pauses_with_message() {
    let playback = PlaybackConfig {
        stop_on_browser_error: true,
        ..PlaybackConfig::default()
    };
    let mut bed = test_bed(
        vec![click(0, "https://shop.example.test/pay")],
        playback,
        ScriptsConfig::default(),
    );
    bed.pool.fail_dispatch.store(true, Ordering::SeqCst);

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    bed.gate.add_permits(1);

    let (_, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::ErrorInBrowser);
    assert_eq!(status, ExperimentStatus::Paused);

    // The cursor stays on the failing step and the browser is kept for
    // inspection and a later resume.
    let paused = bed.controller.status(experiment.id).unwrap();
    assert_eq!(paused.position, 0);
    assert!(paused.error_message.is_some());
    assert!(bed.pool.driver_of(experiment.id).is_some());
    assert!(!bed.controller.is_playing(experiment.id));
}

#[tokio::test]
async fn test_broken_script_step_errors_the_experiment() {
    let broken = step(json!({
        "type": "script",
        "eventId": 1,
        "script": "if { nope",
    }));
    let mut bed = test_bed(
        vec![broken, click(2, "https://shop.example.test/after")],
        PlaybackConfig::default(),
        ScriptsConfig::default(),
    );

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let (event_id, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event_id, experiment.id);
    assert_eq!(event, PlaybackEvent::UnknownError);
    assert_eq!(status, ExperimentStatus::Errored);

    let errored = bed.controller.status(experiment.id).unwrap();
    assert_eq!(errored.status, ExperimentStatus::Errored);
    assert_eq!(errored.position, 0);
    assert!(errored
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("script step failed"));
    assert!(!bed.controller.is_playing(experiment.id));
    // Errored is terminal; the run cannot be picked back up.
    assert!(matches!(
        bed.controller.resume(experiment.id).await,
        Err(PlaybackError::Completed(_))
    ));
}

#[tokio::test]
async fn test_broken_post_process_fails_resume() {
    let scripts = ScriptsConfig {
        post_process_scenario: Some("if { nope".to_string()),
        ..ScriptsConfig::default()
    };
    let bed = test_bed(
        vec![click(0, "https://a.example.test/")],
        PlaybackConfig::default(),
        scripts,
    );

    let err = bed.controller.start("journey", false, false).await.unwrap_err();
    assert!(matches!(err, PlaybackError::Script(_)));

    // The experiment record exists but never started playing.
    let listed = bed.controller.experiments();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ExperimentStatus::Created);
}

#[tokio::test]
async fn test_start_requires_a_stored_recording() {
    let bed = test_bed(Vec::new(), PlaybackConfig::default(), ScriptsConfig::default());
    assert!(matches!(
        bed.controller.start("missing", false, false).await,
        Err(PlaybackError::Storage(_))
    ));
}

// =============================================================================
// Whole journeys
// =============================================================================

#[tokio::test]
async fn test_two_step_journey_plays_to_finished() {
    let keypress = step(json!({
        "type": "keypress",
        "eventId": 2,
        "charCode": 13,
        "target": [{"getName": "q"}],
    }));
    let steps = vec![click(1, "https://shop.example.test/search"), keypress];
    let mut bed = test_bed(steps, PlaybackConfig::default(), ScriptsConfig::default());
    bed.gate.add_permits(16);

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let (event_id, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event_id, experiment.id);
    assert_eq!(event, PlaybackEvent::Done);
    assert_eq!(status, ExperimentStatus::Finished);

    let finished = bed.controller.status(experiment.id).unwrap();
    assert_eq!(finished.position, 2);
    assert_eq!(finished.steps, 2);
    assert!(finished.error_message.is_none());

    // The keypress navigated nowhere; only the click opened a URL.
    let drivers = bed.pool.all_created.lock();
    assert_eq!(drivers.len(), 1);
    assert_eq!(
        drivers[0].opened.lock().clone(),
        vec!["https://shop.example.test/search".to_string()]
    );
    assert_eq!(drivers[0].dispatched.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_configured_bounds_limit_the_run() {
    let playback = PlaybackConfig {
        start_step: 1,
        finish_step: 3,
        ..PlaybackConfig::default()
    };
    let steps = (0..5)
        .map(|i| click(i, &format!("https://shop.example.test/s{i}")))
        .collect();
    let mut bed = test_bed(steps, playback, ScriptsConfig::default());
    bed.gate.add_permits(16);

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let (_, event, _) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::Done);

    assert_eq!(bed.controller.status(experiment.id).unwrap().position, 3);
    let drivers = bed.pool.all_created.lock();
    assert_eq!(
        drivers[0].opened.lock().clone(),
        vec![
            "https://shop.example.test/s1".to_string(),
            "https://shop.example.test/s2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_empty_recording_finishes_immediately() {
    let mut bed = test_bed(Vec::new(), PlaybackConfig::default(), ScriptsConfig::default());

    let experiment = bed.controller.start("journey", false, false).await.unwrap();
    let (_, event, status) = next_event(&mut bed.events).await;
    assert_eq!(event, PlaybackEvent::Done);
    assert_eq!(status, ExperimentStatus::Finished);
    assert_eq!(bed.controller.status(experiment.id).unwrap().position, 0);
    // No browser was ever needed.
    assert!(bed.pool.all_created.lock().is_empty());
}
