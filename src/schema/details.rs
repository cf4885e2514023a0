//! Movie detail page views, carrying a snapshot of the movie card.
use chrono::NaiveDateTime;
use serde::Deserialize;

use super::{timestamp, Row, Value};

pub const TOPIC: &str = "movie_details-events";
pub const TABLE: &str = "movie_details";

pub const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS movie_details (
        user_id String,
        uuid String,
        title String,
        imdb_rating Float32,
        description String,
        genres Array(Tuple(genre_uuid String, name String)),
        actors Array(Tuple(actor_uuid String, full_name String)),
        writers Array(Tuple(writer_uuid String, full_name String)),
        directors Array(Tuple(director_uuid String, full_name String)),
        date_event DateTime
    ) ENGINE = ReplacingMergeTree(date_event)
    PRIMARY KEY (user_id, uuid)";

pub const INSERT: &str = "INSERT INTO movie_details \
    (user_id, uuid, title, imdb_rating, description, genres, actors, writers, directors, date_event) VALUES";

pub const KEY: &[usize] = &[0, 1];
pub const VERSION: usize = 9;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Genre {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Person {
    pub uuid: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetailsEvent {
    pub user_id: String,
    pub uuid: String,
    pub title: String,
    pub imdb_rating: f64,
    pub description: String,
    pub genres: Vec<Genre>,
    pub actors: Vec<Person>,
    pub writers: Vec<Person>,
    pub directors: Vec<Person>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub date_event: NaiveDateTime,
}

impl DetailsEvent {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !self.imdb_rating.is_finite() {
            return Err(format!("imdb_rating {} is not a number", self.imdb_rating));
        }
        Ok(())
    }

    pub fn row(&self) -> Row {
        let genres = self
            .genres
            .iter()
            .map(|g| pair(&g.uuid, &g.name))
            .collect();
        vec![
            Value::from(self.user_id.as_str()),
            Value::from(self.uuid.as_str()),
            Value::from(self.title.as_str()),
            Value::from(self.imdb_rating),
            Value::from(self.description.as_str()),
            Value::Array(genres),
            people(&self.actors),
            people(&self.writers),
            people(&self.directors),
            Value::from(self.date_event),
        ]
    }
}

fn pair(id: &str, name: &str) -> Value {
    Value::Tuple(vec![Value::from(id), Value::from(name)])
}

fn people(list: &[Person]) -> Value {
    Value::Array(list.iter().map(|p| pair(&p.uuid, &p.full_name)).collect())
}
