//! Viewing progress reported by the player.
use chrono::NaiveDateTime;
use serde::Deserialize;

use super::{timestamp, Row, Value};

pub const TOPIC: &str = "movie_progress-events";
pub const TABLE: &str = "movie_progress";

pub const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS movie_progress (
        user_id String,
        movie_id String,
        progress Float32,
        status Enum8('in_progress' = 1, 'completed' = 2),
        last_watched DateTime
    ) ENGINE = ReplacingMergeTree(last_watched)
    PRIMARY KEY (user_id, movie_id)";

pub const INSERT: &str =
    "INSERT INTO movie_progress (user_id, movie_id, progress, status, last_watched) VALUES";

/// Column indexes of the `(user_id, movie_id)` key.
pub const KEY: &[usize] = &[0, 1];
/// Column index of `last_watched`, the merge version.
pub const VERSION: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    InProgress,
    Completed,
}

impl WatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchStatus::InProgress => "in_progress",
            WatchStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressEvent {
    pub user_id: String,
    pub movie_id: String,
    /// percent watched, 0..=100
    pub progress: f64,
    pub status: WatchStatus,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub last_watched: NaiveDateTime,
}

impl ProgressEvent {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !self.progress.is_finite() || !(0.0..=100.0).contains(&self.progress) {
            return Err(format!("progress {} outside 0..=100", self.progress));
        }
        Ok(())
    }

    pub fn row(&self) -> Row {
        vec![
            Value::from(self.user_id.as_str()),
            Value::from(self.movie_id.as_str()),
            Value::from(self.progress),
            Value::from(self.status.as_str()),
            Value::from(self.last_watched),
        ]
    }
}
