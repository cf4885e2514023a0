//! Error types shared by the ingestion pipeline.
use thiserror::Error;

/// Failure to turn a bus message into an [`Event`](crate::schema::Event).
///
/// Parse errors are always recoverable: the offending message is logged and skipped.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    /// Also covers tombstones and zero-length payloads.
    #[error("malformed {topic} event: {reason}")]
    Malformed { topic: String, reason: String },
}

impl ParseError {
    pub(crate) fn malformed(topic: &str, reason: impl ToString) -> Self {
        ParseError::Malformed {
            topic: topic.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn empty_payload(topic: &str) -> Self {
        Self::malformed(topic, "empty payload")
    }
}

/// Failure reported by the column store.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("clickhouse transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("clickhouse rejected statement ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl SinkError {
    /// True when ClickHouse reported that the table being created is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            SinkError::Rejected { body, .. } => body.contains("TABLE_ALREADY_EXISTS"),
            SinkError::Transport(_) => false,
        }
    }
}

/// Failure reported by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Unrecoverable ingestion failure; the process should exit non-zero.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("batch {batch_id} not written after {attempts} attempts: {source}")]
    FlushRetriesExhausted {
        batch_id: uuid::Uuid,
        attempts: u32,
        #[source]
        source: SinkError,
    },
    #[error("offsets not committed after {attempts} attempts: {source}")]
    CommitRetriesExhausted {
        attempts: u32,
        #[source]
        source: BusError,
    },
    #[error("polling failed {attempts} times in a row: {source}")]
    PollRetriesExhausted {
        attempts: u32,
        #[source]
        source: BusError,
    },
}
