//! ## ugc-etl
//! Streams user-generated movie events from Kafka into ClickHouse.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! kafka_brokers = "kafka:9092"
//! topics = ["movie_progress-events", "movie_filters-events", "movie_details-events"]
//! consumer_group = "etl_ugc"
//! batch_size = 100                         # events per ClickHouse flush
//! consume_timeout_seconds = 10
//! consume_max_records = 1000
//! clickhouse_url = "http://clickhouse:8123"
//!
//! [retry]
//! max_attempts = 5
//! backoff_ms = 1000
//! ```
//! Every key can be overridden from the environment, e.g. `UGC_ETL__BATCH_SIZE=500`.
//!
//! ## Events
//! Each topic carries JSON events of one kind, see [schema]. A topic maps to exactly one
//! ClickHouse table, created on startup with a `ReplacingMergeTree` engine so that
//! redelivered events collapse into one row per key.
//!
//! ## Kafka and ClickHouse
//! The [ingester] commits offsets only after the batch holding those messages has been
//! written to every table it touches. A batch whose insert fails is retried as a whole;
//! if it still cannot be written the process exits non-zero without committing, and the
//! next run picks up from the last committed offset.
//!
//! Malformed messages are logged with their topic, partition and offset and skipped.
//!
//! [schema]: schema
//! [ingester]: ingester::Ingester

pub mod batch;
pub mod bus;
pub mod error;
pub mod ingester;
pub mod router;
pub mod schema;
pub mod settings;
pub mod sink;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
