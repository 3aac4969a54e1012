//! Persistence boundaries.
//!
//! Production deployments plug in real backends; the in-memory and
//! directory-backed implementations here serve tests and the bundled
//! binary.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::playback::Experiment;
use crate::scenario::RecordedStep;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("recording '{0}' not found")]
    RecordingNotFound(String),

    #[error("experiment {0} not found")]
    ExperimentNotFound(Uuid),

    #[error("screenshot {1} for experiment {0} not found")]
    ScreenshotNotFound(Uuid, usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("stored data is invalid: {0}")]
    Format(String),
}

/// Read access to stored recordings (step lists keyed by id).
pub trait RecordingRepository: Send + Sync {
    fn get(&self, recording_id: &str) -> Result<Vec<RecordedStep>, StorageError>;
    fn put(&self, recording_id: &str, steps: Vec<RecordedStep>);
}

/// Durable experiment records.
pub trait ExperimentRepository: Send + Sync {
    fn create(&self, experiment: &Experiment) -> Result<(), StorageError>;
    /// Replaces an existing record; unknown ids fail.
    fn update(&self, experiment: &Experiment) -> Result<(), StorageError>;
    fn get(&self, id: Uuid) -> Result<Experiment, StorageError>;
    fn list(&self) -> Vec<Experiment>;
}

/// Screenshot blobs keyed by experiment and step position.
pub trait ScreenshotStore: Send + Sync {
    /// Stores one screenshot and returns the name it was filed under.
    fn save(
        &self,
        experiment: Uuid,
        position: usize,
        errored: bool,
        bytes: &[u8],
    ) -> Result<String, StorageError>;

    fn open(&self, experiment: Uuid, position: usize) -> Result<Vec<u8>, StorageError>;
}

/// Position zero-padded to five digits; failed steps carry an error
/// marker segment in front.
pub fn screenshot_file_name(position: usize, errored: bool) -> String {
    if errored {
        format!("_error_{position:05}.png")
    } else {
        format!("{position:05}.png")
    }
}

#[derive(Default)]
pub struct InMemoryRecordingRepository {
    recordings: RwLock<HashMap<String, Vec<RecordedStep>>>,
}

impl InMemoryRecordingRepository {
    pub fn new() -> Self {
        InMemoryRecordingRepository::default()
    }
}

impl RecordingRepository for InMemoryRecordingRepository {
    fn get(&self, recording_id: &str) -> Result<Vec<RecordedStep>, StorageError> {
        self.recordings
            .read()
            .get(recording_id)
            .cloned()
            .ok_or_else(|| StorageError::RecordingNotFound(recording_id.to_string()))
    }

    fn put(&self, recording_id: &str, steps: Vec<RecordedStep>) {
        self.recordings
            .write()
            .insert(recording_id.to_string(), steps);
    }
}

#[derive(Default)]
pub struct InMemoryExperimentRepository {
    experiments: RwLock<HashMap<Uuid, Experiment>>,
}

impl InMemoryExperimentRepository {
    pub fn new() -> Self {
        InMemoryExperimentRepository::default()
    }
}

impl ExperimentRepository for InMemoryExperimentRepository {
    fn create(&self, experiment: &Experiment) -> Result<(), StorageError> {
        self.experiments
            .write()
            .insert(experiment.id, experiment.clone());
        Ok(())
    }

    fn update(&self, experiment: &Experiment) -> Result<(), StorageError> {
        let mut experiments = self.experiments.write();
        if !experiments.contains_key(&experiment.id) {
            return Err(StorageError::ExperimentNotFound(experiment.id));
        }
        experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Experiment, StorageError> {
        self.experiments
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::ExperimentNotFound(id))
    }

    fn list(&self) -> Vec<Experiment> {
        let mut all: Vec<Experiment> = self.experiments.read().values().cloned().collect();
        all.sort_by_key(|experiment| experiment.created_at);
        all
    }
}

/// Screenshots as files under `<dir>/<experiment>/`.
pub struct DirScreenshotStore {
    dir: PathBuf,
}

impl DirScreenshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirScreenshotStore { dir: dir.into() }
    }

    fn experiment_dir(&self, experiment: Uuid) -> PathBuf {
        self.dir.join(experiment.to_string())
    }
}

impl ScreenshotStore for DirScreenshotStore {
    fn save(
        &self,
        experiment: Uuid,
        position: usize,
        errored: bool,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let dir = self.experiment_dir(experiment);
        std::fs::create_dir_all(&dir)?;
        let name = screenshot_file_name(position, errored);
        std::fs::write(dir.join(&name), bytes)?;
        Ok(name)
    }

    fn open(&self, experiment: Uuid, position: usize) -> Result<Vec<u8>, StorageError> {
        let dir = self.experiment_dir(experiment);
        // A step may have finished cleanly or errored; try both names.
        for errored in [false, true] {
            let path = dir.join(screenshot_file_name(position, errored));
            if path.exists() {
                return Ok(std::fs::read(path)?);
            }
        }
        Err(StorageError::ScreenshotNotFound(experiment, position))
    }
}

/// Keeps screenshots in memory, with the same naming as the directory
/// store.
#[derive(Default)]
pub struct InMemoryScreenshotStore {
    shots: RwLock<HashMap<(Uuid, usize), (String, Vec<u8>)>>,
}

impl InMemoryScreenshotStore {
    pub fn new() -> Self {
        InMemoryScreenshotStore::default()
    }

    pub fn name_of(&self, experiment: Uuid, position: usize) -> Option<String> {
        self.shots
            .read()
            .get(&(experiment, position))
            .map(|(name, _)| name.clone())
    }

    pub fn count(&self) -> usize {
        self.shots.read().len()
    }
}

impl ScreenshotStore for InMemoryScreenshotStore {
    fn save(
        &self,
        experiment: Uuid,
        position: usize,
        errored: bool,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let name = screenshot_file_name(position, errored);
        self.shots
            .write()
            .insert((experiment, position), (name.clone(), bytes.to_vec()));
        Ok(name)
    }

    fn open(&self, experiment: Uuid, position: usize) -> Result<Vec<u8>, StorageError> {
        self.shots
            .read()
            .get(&(experiment, position))
            .map(|(_, bytes)| bytes.clone())
            .ok_or(StorageError::ScreenshotNotFound(experiment, position))
    }
}
