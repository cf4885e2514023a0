//! Topic schemas.
//!
//! Every topic the ETL consumes maps to exactly one [`EventKind`], which in turn
//! owns the destination table and its DDL. Parsing happens once per message, after
//! that the rest of the pipeline only deals with [`Event::row`] projections.
pub mod details;
pub mod filters;
pub mod progress;
pub mod timestamp;
pub mod value;

pub use details::DetailsEvent;
pub use filters::FiltersEvent;
pub use progress::{ProgressEvent, WatchStatus};
pub use value::{Row, Value};

use crate::error::ParseError;

/// Kind of user-generated event, one per topic and per destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Filters,
    Details,
}

impl EventKind {
    /// All kinds, in the order batches are routed to the sink.
    pub const ALL: [EventKind; 3] = [EventKind::Progress, EventKind::Filters, EventKind::Details];

    pub fn from_topic(topic: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.topic() == topic)
    }

    pub fn topic(self) -> &'static str {
        match self {
            EventKind::Progress => progress::TOPIC,
            EventKind::Filters => filters::TOPIC,
            EventKind::Details => details::TOPIC,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EventKind::Progress => progress::TABLE,
            EventKind::Filters => filters::TABLE,
            EventKind::Details => details::TABLE,
        }
    }

    pub fn create_table(self) -> &'static str {
        match self {
            EventKind::Progress => progress::CREATE_TABLE,
            EventKind::Filters => filters::CREATE_TABLE,
            EventKind::Details => details::CREATE_TABLE,
        }
    }

    /// `INSERT INTO <table> (<columns>) VALUES` without any rows.
    pub fn insert_statement(self) -> &'static str {
        match self {
            EventKind::Progress => progress::INSERT,
            EventKind::Filters => filters::INSERT,
            EventKind::Details => details::INSERT,
        }
    }

    /// Indexes into [`Event::row`] forming the table's primary key.
    pub fn key_columns(self) -> &'static [usize] {
        match self {
            EventKind::Progress => progress::KEY,
            EventKind::Filters => filters::KEY,
            EventKind::Details => details::KEY,
        }
    }

    /// Index into [`Event::row`] of the `ReplacingMergeTree` version column.
    pub fn version_column(self) -> usize {
        match self {
            EventKind::Progress => progress::VERSION,
            EventKind::Filters => filters::VERSION,
            EventKind::Details => details::VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(ProgressEvent),
    Filters(FiltersEvent),
    Details(DetailsEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Progress(_) => EventKind::Progress,
            Event::Filters(_) => EventKind::Filters,
            Event::Details(_) => EventKind::Details,
        }
    }

    pub fn row(&self) -> Row {
        match self {
            Event::Progress(e) => e.row(),
            Event::Filters(e) => e.row(),
            Event::Details(e) => e.row(),
        }
    }
}

/// Parses a raw bus payload according to the schema registered for `topic`.
pub fn parse(topic: &str, raw: &[u8]) -> Result<Event, ParseError> {
    let kind = EventKind::from_topic(topic).ok_or_else(|| ParseError::UnknownTopic(topic.to_owned()))?;
    if raw.is_empty() {
        return Err(ParseError::empty_payload(topic));
    }
    let malformed = |e: serde_json::Error| ParseError::malformed(topic, e);
    match kind {
        EventKind::Progress => {
            let ev: ProgressEvent = serde_json::from_slice(raw).map_err(malformed)?;
            ev.validate().map_err(|e| ParseError::malformed(topic, e))?;
            Ok(Event::Progress(ev))
        }
        EventKind::Filters => Ok(Event::Filters(serde_json::from_slice(raw).map_err(malformed)?)),
        EventKind::Details => {
            let ev: DetailsEvent = serde_json::from_slice(raw).map_err(malformed)?;
            ev.validate().map_err(|e| ParseError::malformed(topic, e))?;
            Ok(Event::Details(ev))
        }
    }
}
