//! In-memory bus and sink for exercising the ingester without Kafka or ClickHouse.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::batch::Offsets;
use crate::bus::{BusMessage, EventBus};
use crate::error::{BusError, SinkError};
use crate::schema::{self, Event, EventKind, Row, Value};
use crate::sink::AnalyticSink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct BusState {
    queue: VecDeque<BusMessage>,
    next_offset: HashMap<(String, i32), i64>,
    committed: HashMap<(String, i32), i64>,
    commit_calls: usize,
    failing_commits: usize,
    failing_polls: usize,
    polls: usize,
    closed: bool,
    cancel_when_idle: Option<CancellationToken>,
    commit_calls_when_idle: Option<usize>,
}

/// Partitioned log kept in memory. Clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its offset.
    pub fn publish(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let mut state = lock(&self.state);
        let next = state.next_offset.entry((topic.to_owned(), partition)).or_insert(0);
        let offset = *next;
        *next += 1;
        state.queue.push_back(BusMessage {
            topic: topic.to_owned(),
            partition,
            offset,
            payload: Some(payload.into()),
        });
        offset
    }

    pub fn publish_tombstone(&self, topic: &str, partition: i32) -> i64 {
        let offset = self.publish(topic, partition, Vec::new());
        if let Some(last) = lock(&self.state).queue.back_mut() {
            last.payload = None;
        }
        offset
    }

    /// Cancels `token` the first time a poll finds the log empty.
    pub fn cancel_when_idle(&self, token: CancellationToken) {
        lock(&self.state).cancel_when_idle = Some(token);
    }

    pub fn fail_next_commits(&self, n: usize) {
        lock(&self.state).failing_commits = n;
    }

    pub fn fail_next_polls(&self, n: usize) {
        lock(&self.state).failing_polls = n;
    }

    /// Next offset to read for the partition, as a consumer group would store it.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state).committed.get(&(topic.to_owned(), partition)).copied()
    }

    pub fn commit_calls(&self) -> usize {
        lock(&self.state).commit_calls
    }

    /// Commit calls made before a poll first found the log empty.
    pub fn commit_calls_when_idle(&self) -> Option<usize> {
        lock(&self.state).commit_calls_when_idle
    }

    pub fn polls(&self) -> usize {
        lock(&self.state).polls
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn poll(&mut self, max_records: usize, _timeout: Duration) -> Result<Vec<BusMessage>, BusError> {
        let mut state = lock(&self.state);
        state.polls += 1;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(BusError::Unavailable("injected poll failure".into()));
        }
        let n = max_records.min(state.queue.len());
        let messages: Vec<BusMessage> = state.queue.drain(..n).collect();
        if messages.is_empty() {
            if state.commit_calls_when_idle.is_none() {
                state.commit_calls_when_idle = Some(state.commit_calls);
            }
            if let Some(token) = &state.cancel_when_idle {
                token.cancel();
            }
        }
        Ok(messages)
    }

    async fn commit(&mut self, offsets: &Offsets) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        state.commit_calls += 1;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BusError::Unavailable("injected commit failure".into()));
        }
        for ((topic, partition), high) in offsets.iter() {
            state.committed.insert((topic.clone(), *partition), high + 1);
        }
        Ok(())
    }

    async fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}

#[derive(Default)]
struct SinkState {
    tables: HashSet<&'static str>,
    merged: HashMap<EventKind, HashMap<Vec<String>, Row>>,
    inserted: HashMap<EventKind, usize>,
    insert_log: Vec<(EventKind, usize)>,
    attempts: usize,
    failing_attempts: HashSet<usize>,
    unavailable: bool,
}

/// Column store double that merges rows the way `ReplacingMergeTree` does once
/// merges have run: one row per key, the highest version wins, ties go to the
/// latest insert.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `n`-th insert attempt (1-based, counted over the sink's lifetime) fail.
    pub fn fail_insert_number(&self, n: usize) {
        lock(&self.state).failing_attempts.insert(n);
    }

    /// While set, every statement fails and every fetch returns `None`.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<_> = lock(&self.state).tables.iter().copied().collect();
        tables.sort_unstable();
        tables
    }

    /// Distinct keys stored for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.state).merged.get(&kind).map_or(0, HashMap::len)
    }

    /// Merged rows for `kind`, in no particular order.
    pub fn rows(&self, kind: EventKind) -> Vec<Row> {
        lock(&self.state)
            .merged
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows ever accepted for `kind`, duplicates included.
    pub fn inserted_rows(&self, kind: EventKind) -> usize {
        lock(&self.state).inserted.get(&kind).copied().unwrap_or(0)
    }

    /// Successful bulk inserts as (table kind, row count), in execution order.
    pub fn insert_log(&self) -> Vec<(EventKind, usize)> {
        lock(&self.state).insert_log.clone()
    }

    pub fn inserts(&self) -> usize {
        lock(&self.state).insert_log.len()
    }

    pub fn insert_attempts(&self) -> usize {
        lock(&self.state).attempts
    }
}

fn injected() -> SinkError {
    SinkError::Rejected {
        status: 503,
        body: "injected failure".into(),
    }
}

#[async_trait]
impl AnalyticSink for MemorySink {
    async fn execute(&self, statement: &str, rows: &[Row]) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        if rows.is_empty() {
            if state.unavailable {
                return Err(injected());
            }
            if let Some(kind) = EventKind::ALL.into_iter().find(|k| k.create_table() == statement) {
                state.tables.insert(kind.table());
            }
            return Ok(());
        }

        state.attempts += 1;
        let attempt = state.attempts;
        if state.unavailable || state.failing_attempts.contains(&attempt) {
            return Err(injected());
        }
        let Some(kind) = EventKind::ALL.into_iter().find(|k| k.insert_statement() == statement) else {
            return Err(SinkError::Rejected {
                status: 404,
                body: format!("UNKNOWN_TABLE: {statement}"),
            });
        };

        let table = state.merged.entry(kind).or_default();
        for row in rows {
            let key: Vec<String> = kind.key_columns().iter().map(|&i| row[i].to_string()).collect();
            let replace = match table.get(&key) {
                Some(stored) => version(stored, kind) <= version(row, kind),
                None => true,
            };
            if replace {
                table.insert(key, row.clone());
            }
        }
        *state.inserted.entry(kind).or_default() += rows.len();
        state.insert_log.push((kind, rows.len()));
        Ok(())
    }

    async fn fetch(&self, _query: &str) -> Option<Vec<serde_json::Value>> {
        if lock(&self.state).unavailable {
            return None;
        }
        Some(vec![serde_json::json!({ "version": "memory" })])
    }
}

fn version(row: &Row, kind: EventKind) -> Option<chrono::NaiveDateTime> {
    match row.get(kind.version_column()) {
        Some(Value::DateTime(ts)) => Some(*ts),
        _ => None,
    }
}

/// Builder for `movie_progress-events` payloads.
#[derive(Debug, Clone)]
pub struct ProgressFixture {
    user_id: String,
    movie_id: String,
    progress: f64,
    status: &'static str,
    last_watched: String,
}

impl ProgressFixture {
    pub fn new(user_id: &str, movie_id: &str) -> Self {
        ProgressFixture {
            user_id: user_id.to_owned(),
            movie_id: movie_id.to_owned(),
            progress: 42.5,
            status: "in_progress",
            last_watched: "2024-01-01T00:00:00".to_owned(),
        }
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    pub fn completed(mut self) -> Self {
        self.status = "completed";
        self
    }

    pub fn at(mut self, last_watched: &str) -> Self {
        self.last_watched = last_watched.to_owned();
        self
    }

    pub fn json(&self) -> String {
        serde_json::json!({
            "user_id": self.user_id,
            "movie_id": self.movie_id,
            "progress": self.progress,
            "status": self.status,
            "last_watched": self.last_watched,
        })
        .to_string()
    }

    /// Parsed event; panics on an invalid fixture.
    pub fn event(&self) -> Event {
        match schema::parse(schema::progress::TOPIC, self.json().as_bytes()) {
            Ok(ev) => ev,
            Err(e) => panic!("invalid progress fixture: {e}"),
        }
    }
}
