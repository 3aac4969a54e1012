//! Experiment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle: `created → playing ⇄ paused`, `playing → finished`,
/// `playing → errored`. `finished` and `errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExperimentStatus {
    Created,
    Playing,
    Paused,
    Finished,
    Errored,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Finished | ExperimentStatus::Errored)
    }
}

/// One replay run of a recording, with its own cursor and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: Uuid,
    pub recording_id: String,
    pub status: ExperimentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Next step to execute.
    pub position: usize,
    /// Exclusive upper bound; 0 plays to the end.
    pub limit: usize,
    /// Step count of the recording at creation time.
    pub steps: usize,
    pub screenshots: bool,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(
        recording_id: impl Into<String>,
        position: usize,
        limit: usize,
        steps: usize,
        screenshots: bool,
    ) -> Self {
        Experiment {
            id: Uuid::new_v4(),
            recording_id: recording_id.into(),
            status: ExperimentStatus::Created,
            error_message: None,
            position,
            limit,
            steps,
            screenshots,
            created_at: Utc::now(),
        }
    }
}
