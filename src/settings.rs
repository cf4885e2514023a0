//! Application config
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::schema::EventKind;

/// Flush/commit/poll retry budget
#[derive(Debug, Clone, Deserialize)]
pub struct Retry {
    /// attempts before giving up, the first one included (default: 5)
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    /// delay after the first failure, doubled on each retry (default: 1000)
    #[serde(default = "defaults::backoff_ms")]
    pub backoff_ms: u64,
    /// upper bound for the delay (default: 60000)
    #[serde(default = "defaults::max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            max_attempts: defaults::max_attempts(),
            backoff_ms: defaults::backoff_ms(),
            max_backoff_ms: defaults::max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Log {
    /// emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// comma separated bootstrap brokers
    pub kafka_brokers: String,
    /// topics to consume, a list or a comma separated string (default: all event topics)
    #[serde(default = "defaults::topics", deserialize_with = "topic_list")]
    pub topics: Vec<String>,
    /// consumer group to use (default: etl_ugc)
    #[serde(default = "defaults::consumer_group")]
    pub consumer_group: String,
    /// where to start without a committed offset (default: earliest)
    #[serde(default = "defaults::auto_offset_reset")]
    pub auto_offset_reset: String,
    /// events per ClickHouse flush (default: 100)
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    /// flush a partial batch once it is this old (default: only flush full batches)
    pub max_batch_age_seconds: Option<u64>,
    /// how long a poll waits for messages (default: 10)
    #[serde(default = "defaults::consume_timeout_seconds")]
    pub consume_timeout_seconds: u64,
    /// messages fetched per poll (default: 1000)
    #[serde(default = "defaults::consume_max_records")]
    pub consume_max_records: usize,
    /// URL of ClickHouse HTTP interface
    #[serde(default = "defaults::clickhouse_url")]
    pub clickhouse_url: String,
    #[serde(default = "defaults::clickhouse_database")]
    pub clickhouse_database: String,
    pub clickhouse_user: Option<String>,
    pub clickhouse_password: Option<String>,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub log: Log,
}

/// Accepts a list from files and a comma separated string from the environment.
fn topic_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Topics {
        List(Vec<String>),
        Csv(String),
    }
    Ok(match Topics::deserialize(deserializer)? {
        Topics::List(topics) => topics,
        Topics::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect(),
    })
}

mod defaults {
    use crate::schema::EventKind;

    pub fn topics() -> Vec<String> {
        EventKind::ALL.iter().map(|k| k.topic().to_owned()).collect()
    }
    pub fn consumer_group() -> String {
        "etl_ugc".into()
    }
    pub fn auto_offset_reset() -> String {
        "earliest".into()
    }
    pub fn batch_size() -> usize {
        crate::batch::DEFAULT_BATCH_SIZE
    }
    pub fn consume_timeout_seconds() -> u64 {
        10
    }
    pub fn consume_max_records() -> usize {
        1000
    }
    pub fn clickhouse_url() -> String {
        "http://clickhouse:8123".into()
    }
    pub fn clickhouse_database() -> String {
        "default".into()
    }
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn backoff_ms() -> u64 {
        1000
    }
    pub fn max_backoff_ms() -> u64 {
        60_000
    }
}

impl Settings {
    /// Layers `config/default`, the optional `cfgfile` and `UGC_ETL__*` environment variables.
    pub fn new(cfgfile: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(cfgfile, Environment::with_prefix("UGC_ETL").separator("__"))
    }

    // Environment values stay strings until deserialized, so "007" is not read as 7.
    fn load(cfgfile: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));
        if let Some(cfgfile) = cfgfile {
            builder = builder.add_source(File::with_name(cfgfile).required(true));
        }
        let cfg = builder
            .add_source(env)
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be at least 1".into()));
        }
        if self.consume_max_records == 0 {
            return Err(ConfigError::Message("consume_max_records must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message("retry.max_attempts must be at least 1".into()));
        }
        if self.topics.is_empty() {
            return Err(ConfigError::Message("no topics configured".into()));
        }
        if let Some(topic) = self.topics.iter().find(|t| EventKind::from_topic(t).is_none()) {
            return Err(ConfigError::Message(format!("no schema registered for topic {topic}")));
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(ConfigError::Message(format!(
                "auto_offset_reset must be earliest or latest, got {}",
                self.auto_offset_reset
            )));
        }
        Ok(())
    }
}
