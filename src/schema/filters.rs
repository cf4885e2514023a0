//! Catalogue search filters a user applied.
use chrono::NaiveDateTime;
use serde::Deserialize;

use super::{timestamp, Row, Value};

pub const TOPIC: &str = "movie_filters-events";
pub const TABLE: &str = "movie_filters";

pub const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS movie_filters (
        user_id String,
        query String,
        page UInt32,
        size UInt32,
        date_event DateTime
    ) ENGINE = ReplacingMergeTree(date_event)
    PRIMARY KEY (user_id, query, date_event)";

pub const INSERT: &str =
    "INSERT INTO movie_filters (user_id, query, page, size, date_event) VALUES";

pub const KEY: &[usize] = &[0, 1, 4];
pub const VERSION: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FiltersEvent {
    pub user_id: String,
    pub query: String,
    pub page: u32,
    pub size: u32,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub date_event: NaiveDateTime,
}

impl FiltersEvent {
    pub fn row(&self) -> Row {
        vec![
            Value::from(self.user_id.as_str()),
            Value::from(self.query.as_str()),
            Value::from(self.page),
            Value::from(self.size),
            Value::from(self.date_event),
        ]
    }
}
