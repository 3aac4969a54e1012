use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use reenact::ca::CertificateAuthority;
use reenact::capture::{CaptureService, JsonDirSink};
use reenact::config::Config;
use reenact::playback::{ControllerDeps, Experiment, LogNotifier, Notifier, PlaybackController, PlaybackEvent};
use reenact::replay::{BrowserDriver, DispatchEvent, DriverError, DriverPool};
use reenact::scenario::{FramePath, RecordedStep};
use reenact::scripting::RhaiScriptHost;
use reenact::storage::{
    DirScreenshotStore, InMemoryExperimentRepository, InMemoryRecordingRepository,
    RecordingRepository,
};

#[derive(Parser, Debug)]
#[command(
    name = "reenact",
    version,
    about = "Record web sessions through an intercepting proxy and replay them step by step"
)]
struct Args {
    /// Configuration file (YAML).
    #[arg(short, long, env = "REENACT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `reenact=debug`.
    #[arg(long, env = "REENACT_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a capture proxy session until interrupted, then seal artifacts.
    Record {
        /// Session name; artifacts are filed under it.
        #[arg(long, default_value = "recording")]
        session: String,

        /// Directory sealed artifacts and the root certificate go to.
        #[arg(long, default_value = "artifacts")]
        out: PathBuf,
    },

    /// Replay a recorded step list without a browser (dry run).
    Play {
        /// JSON file holding the recorded steps.
        recording: PathBuf,

        /// Store a screenshot after every step.
        #[arg(long)]
        screenshots: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                args.log_level
                    .parse()
                    .context("invalid --log-level directive")?,
            ),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("could not load {}", path.display()))?,
        None => Config::default(),
    };

    match args.command {
        Command::Record { session, out } => record(config, &session, &out).await,
        Command::Play {
            recording,
            screenshots,
        } => play(config, &recording, screenshots).await,
    }
}

async fn record(config: Config, session: &str, out: &Path) -> anyhow::Result<()> {
    let ca = Arc::new(CertificateAuthority::open(&config.capture.keystore)?);
    std::fs::create_dir_all(out)
        .with_context(|| format!("could not create {}", out.display()))?;
    let sink = Arc::new(JsonDirSink::new(out));
    let service = CaptureService::new(config.capture, ca, sink);

    let port = service.start(session).await?;
    println!("Recording '{session}' on proxy port {port}");

    if let Ok(pem) = service.root_certificate_pem() {
        let root_path = out.join("reenact-root.pem");
        std::fs::write(&root_path, pem)
            .with_context(|| format!("could not write {}", root_path.display()))?;
        println!("Trust this root certificate in the browser: {}", root_path.display());
    }
    println!("Press Ctrl-C to stop and seal artifacts");

    tokio::signal::ctrl_c().await?;
    let accepted = service.stop(session)?;
    println!("Sealed {accepted} samplers into {}", out.display());
    Ok(())
}

async fn play(config: Config, recording: &Path, with_screenshots: bool) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(recording)
        .with_context(|| format!("could not read {}", recording.display()))?;
    let steps: Vec<RecordedStep> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a recorded step list", recording.display()))?;
    let recording_id = recording
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("recording")
        .to_string();
    println!("Loaded {} steps from {}", steps.len(), recording.display());

    let recordings = Arc::new(InMemoryRecordingRepository::new());
    recordings.put(&recording_id, steps);

    // Companion capture needs the full interception stack; build it
    // only when the config asks for it.
    let capture = if config.playback.capture_on_replay.enabled {
        let ca = Arc::new(CertificateAuthority::open(&config.capture.keystore)?);
        let sink = Arc::new(JsonDirSink::new("artifacts"));
        Some(Arc::new(CaptureService::new(
            config.capture.clone(),
            ca,
            sink,
        )))
    } else {
        None
    };

    let notifier = Arc::new(CliNotifier::default());
    let controller = PlaybackController::new(
        config.playback.clone(),
        config.scripts.clone(),
        ControllerDeps {
            recordings,
            experiments: Arc::new(InMemoryExperimentRepository::new()),
            screenshots: Arc::new(DirScreenshotStore::new(
                config.playback.screenshots.dir.clone(),
            )),
            driver_pool: Arc::new(DryRunPool),
            script_host: Arc::new(RhaiScriptHost::default()),
            notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
            capture,
        },
    );

    let experiment = controller
        .start(&recording_id, with_screenshots, false)
        .await?;
    println!("Experiment {} playing", experiment.id);

    notifier.done.notified().await;
    let final_state = controller.status(experiment.id)?;
    println!(
        "Experiment {} ended as {:?} at step {}",
        final_state.id, final_state.status, final_state.position
    );
    if let Some(message) = &final_state.error_message {
        println!("  {message}");
    }
    Ok(())
}

/// Logs every completion and wakes the waiting command loop. The
/// controller notifies only after the final experiment state is
/// persisted, so a woken waiter reads the settled record.
#[derive(Default)]
struct CliNotifier {
    log: LogNotifier,
    done: Notify,
}

impl Notifier for CliNotifier {
    fn notify(&self, experiment: &Experiment, event: PlaybackEvent) {
        self.log.notify(experiment, event);
        self.done.notify_one();
    }
}

/// Stands in for a browser: every call succeeds and actions are logged.
struct DryRunDriver;

#[async_trait]
impl BrowserDriver for DryRunDriver {
    async fn open(&self, url: &str) -> Result<(), DriverError> {
        info!(url, "dry run: open");
        Ok(())
    }

    async fn wait_settled(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn switch_frames(&self, path: &FramePath) -> Result<(), DriverError> {
        if !matches!(path, FramePath::Root) {
            info!(?path, "dry run: switch frames");
        }
        Ok(())
    }

    async fn dispatch(&self, event: &DispatchEvent) -> Result<(), DriverError> {
        info!(
            kind = ?event.kind,
            xpath = event.xpath.as_deref().unwrap_or(""),
            "dry run: dispatch"
        );
        Ok(())
    }

    async fn eval_in_page(&self, _script: &str) -> Result<Value, DriverError> {
        Ok(Value::Null)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }
}

struct DryRunPool;

#[async_trait]
impl DriverPool for DryRunPool {
    async fn acquire(&self, _experiment: Uuid) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::new(DryRunDriver))
    }

    async fn release(&self, _experiment: Uuid, _driver: Arc<dyn BrowserDriver>) {}

    async fn discard(&self, _experiment: Uuid) {}
}
