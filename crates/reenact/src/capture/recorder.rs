//! Artifact partitioning.
//!
//! Accepted samplers accumulate into the current partition; once it
//! reaches the configured maximum it is sealed into the sink and a
//! fresh one starts. `finish` seals whatever is left, so N accepted
//! samplers with a maximum of K produce ceil(N / K) artifacts.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::exchange::Sampler;

/// A sealed partition of recorded samplers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub session: String,
    /// Zero-based position of this partition within the session.
    pub index: usize,
    pub samplers: Vec<Sampler>,
}

/// Destination for sealed artifacts.
pub trait ArtifactSink: Send + Sync {
    fn seal(&self, artifact: Artifact);
}

/// Keeps sealed artifacts in memory. Used by tests and by callers
/// that post-process artifacts before writing them anywhere.
#[derive(Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<Artifact>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.lock().clone()
    }
}

impl ArtifactSink for MemorySink {
    fn seal(&self, artifact: Artifact) {
        self.artifacts.lock().push(artifact);
    }
}

/// Writes each sealed artifact as pretty-printed JSON under a
/// directory, one file per partition.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonDirSink { dir: dir.into() }
    }
}

impl ArtifactSink for JsonDirSink {
    fn seal(&self, artifact: Artifact) {
        let path = self
            .dir
            .join(format!("{}-{:05}.json", artifact.session, artifact.index));
        let written = std::fs::create_dir_all(&self.dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| serde_json::to_string_pretty(&artifact).map_err(anyhow::Error::from))
            .and_then(|json| std::fs::write(&path, json).map_err(anyhow::Error::from));
        match written {
            Ok(()) => info!(path = %path.display(), samplers = artifact.samplers.len(), "sealed artifact"),
            Err(error) => error!(path = %path.display(), %error, "failed to write artifact"),
        }
    }
}

/// Collects samplers for one recording session and cuts them into
/// artifacts.
pub struct ScenarioRecorder {
    session: String,
    max_per_artifact: usize,
    sink: Arc<dyn ArtifactSink>,
    state: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    current: Vec<Sampler>,
    sealed: usize,
    accepted: usize,
}

impl ScenarioRecorder {
    /// `max_per_artifact == 0` disables partitioning: everything lands
    /// in one artifact at `finish`.
    pub fn new(session: impl Into<String>, max_per_artifact: usize, sink: Arc<dyn ArtifactSink>) -> Self {
        ScenarioRecorder {
            session: session.into(),
            max_per_artifact,
            sink,
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn append(&self, sampler: Sampler) {
        let mut state = self.state.lock();
        debug!(session = %self.session, method = %sampler.method, path = %sampler.path, "recorded sampler");
        state.current.push(sampler);
        state.accepted += 1;
        if self.max_per_artifact > 0 && state.current.len() >= self.max_per_artifact {
            self.seal_locked(&mut state);
        }
    }

    /// Seals the trailing partial partition, if any.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if !state.current.is_empty() {
            self.seal_locked(&mut state);
        }
    }

    /// Samplers accepted so far, across all partitions.
    pub fn accepted(&self) -> usize {
        self.state.lock().accepted
    }

    fn seal_locked(&self, state: &mut RecorderState) {
        let index = state.sealed;
        state.sealed += 1;
        let samplers = std::mem::take(&mut state.current);
        self.sink.seal(Artifact {
            session: self.session.clone(),
            index,
            samplers,
        });
    }
}
