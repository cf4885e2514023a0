//! The consume → batch → flush → commit loop.
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{Accumulator, Batch, Offsets};
use crate::bus::{BusMessage, EventBus};
use crate::error::{IngestError, ParseError};
use crate::router;
use crate::schema;
use crate::settings::Settings;
use crate::sink::AnalyticSink;

/// Exponential backoff shared by polling, flushing and committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// total attempts, the first one included
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub batch_size: usize,
    /// flush a non-empty batch older than this even if it isn't full
    pub max_batch_age: Option<Duration>,
    pub consume_timeout: Duration,
    pub consume_max_records: usize,
    pub retry: RetryPolicy,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        IngesterConfig {
            batch_size: crate::batch::DEFAULT_BATCH_SIZE,
            max_batch_age: None,
            consume_timeout: Duration::from_secs(10),
            consume_max_records: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Settings> for IngesterConfig {
    fn from(s: &Settings) -> Self {
        IngesterConfig {
            batch_size: s.batch_size,
            max_batch_age: s.max_batch_age_seconds.map(Duration::from_secs),
            consume_timeout: Duration::from_secs(s.consume_timeout_seconds),
            consume_max_records: s.consume_max_records,
            retry: RetryPolicy {
                max_attempts: s.retry.max_attempts,
                backoff: Duration::from_millis(s.retry.backoff_ms),
                max_backoff: Duration::from_millis(s.retry.max_backoff_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngesterState {
    Idle,
    Polling,
    Parsing,
    Accumulating,
    Flushing,
    Committing,
    ShuttingDown,
    Stopped,
    Fatal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub messages: u64,
    pub skipped: u64,
    pub rows_written: u64,
    pub batches_flushed: u64,
    pub commits: u64,
}

/// Single consumer loop. Owns the bus, the sink and the pending batch; offsets are
/// only committed once every row they cover has been written.
pub struct Ingester<B: EventBus, S: AnalyticSink> {
    bus: B,
    sink: S,
    accumulator: Accumulator,
    config: IngesterConfig,
    state: IngesterState,
    stats: IngestStats,
}

impl<B: EventBus, S: AnalyticSink> Ingester<B, S> {
    pub fn new(bus: B, sink: S, config: IngesterConfig) -> Ingester<B, S> {
        Ingester {
            bus,
            sink,
            accumulator: Accumulator::new(config.batch_size),
            config,
            state: IngesterState::Idle,
            stats: IngestStats::default(),
        }
    }

    pub fn state(&self) -> IngesterState {
        self.state
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Runs until `cancel` fires or an unrecoverable error occurs.
    ///
    /// On cancellation whatever is pending is flushed and committed before the bus is
    /// released. An error means some data could not be written; offsets past it were
    /// not committed.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), IngestError> {
        info!(
            batch_size = self.accumulator.capacity(),
            max_records = self.config.consume_max_records,
            "ingester started"
        );
        let result = match self.consume(&cancel).await {
            Ok(()) => self.shutdown().await,
            Err(e) => Err(e),
        };
        self.bus.close().await;
        match &result {
            Ok(()) => {
                self.state = IngesterState::Stopped;
                info!(stats = ?self.stats, "ingester stopped");
            }
            Err(e) => {
                self.state = IngesterState::Fatal;
                error!(error = %e, stats = ?self.stats, "ingester failed");
            }
        }
        result
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<(), IngestError> {
        let mut poll_failures = 0;
        while !cancel.is_cancelled() {
            self.state = IngesterState::Polling;
            let messages = match self
                .bus
                .poll(self.config.consume_max_records, self.config.consume_timeout)
                .await
            {
                Ok(messages) => {
                    poll_failures = 0;
                    messages
                }
                Err(e) => {
                    poll_failures += 1;
                    if poll_failures >= self.config.retry.max_attempts {
                        return Err(IngestError::PollRetriesExhausted {
                            attempts: poll_failures,
                            source: e,
                        });
                    }
                    let delay = self.config.retry.delay(poll_failures);
                    warn!(attempt = poll_failures, ?delay, error = %e, "polling failed");
                    sleep(delay).await;
                    continue;
                }
            };

            if messages.is_empty() {
                debug!("no messages within poll timeout");
            } else {
                debug!(count = messages.len(), "polled messages");
            }
            for msg in messages {
                if let Some(batch) = self.ingest(msg) {
                    self.flush_and_commit(batch).await?;
                }
            }

            if self.batch_expired() {
                let batch = self.accumulator.drain();
                debug!(events = batch.len(), "pending batch reached max age");
                self.flush_and_commit(batch).await?;
            }
        }
        Ok(())
    }

    /// Parses one message into the accumulator, returning a batch when it fills up.
    fn ingest(&mut self, msg: BusMessage) -> Option<Batch> {
        self.state = IngesterState::Parsing;
        self.stats.messages += 1;
        let parsed = match &msg.payload {
            Some(payload) => schema::parse(&msg.topic, payload),
            None => Err(ParseError::empty_payload(&msg.topic)),
        };
        match parsed {
            Ok(event) => {
                self.state = IngesterState::Accumulating;
                self.accumulator.append(event, &msg.topic, msg.partition, msg.offset)
            }
            Err(e) => {
                self.stats.skipped += 1;
                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "skipping message"
                );
                self.accumulator.skip(&msg.topic, msg.partition, msg.offset);
                None
            }
        }
    }

    fn batch_expired(&self) -> bool {
        match self.config.max_batch_age {
            Some(max) => {
                self.accumulator.has_pending() && self.accumulator.age().is_some_and(|age| age >= max)
            }
            None => false,
        }
    }

    async fn flush_and_commit(&mut self, batch: Batch) -> Result<(), IngestError> {
        self.flush(&batch).await?;
        self.commit(&batch.offsets).await
    }

    /// Writes the whole batch, retrying it as a unit.
    #[instrument(skip_all, fields(batch_id = %batch.id, events = batch.len()))]
    async fn flush(&mut self, batch: &Batch) -> Result<(), IngestError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.state = IngesterState::Flushing;
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match router::route(&self.sink, batch).await {
                Ok(()) => {
                    self.stats.rows_written += batch.len() as u64;
                    self.stats.batches_flushed += 1;
                    info!(attempt, "batch flushed");
                    return Ok(());
                }
                Err(e) if attempt >= policy.max_attempts => {
                    error!(attempt, error = %e, "giving up on batch");
                    return Err(IngestError::FlushRetriesExhausted {
                        batch_id: batch.id,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "flush failed, retrying whole batch");
                    sleep(delay).await;
                }
            }
        }
    }

    async fn commit(&mut self, offsets: &Offsets) -> Result<(), IngestError> {
        if offsets.is_empty() {
            return Ok(());
        }
        self.state = IngesterState::Committing;
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bus.commit(offsets).await {
                Ok(()) => {
                    self.stats.commits += 1;
                    debug!(partitions = offsets.len(), "offsets committed");
                    return Ok(());
                }
                Err(e) if attempt >= policy.max_attempts => {
                    return Err(IngestError::CommitRetriesExhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    // rows are already in the sink, a late commit only means redelivery
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "commit failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), IngestError> {
        self.state = IngesterState::ShuttingDown;
        let batch = self.accumulator.drain();
        info!(events = batch.len(), "shutting down, flushing pending events");
        self.flush(&batch).await?;
        if !batch.offsets.is_empty() {
            match self.bus.commit(&batch.offsets).await {
                Ok(()) => self.stats.commits += 1,
                Err(e) => warn!(error = %e, "final commit failed, last window will be redelivered"),
            }
        }
        Ok(())
    }
}
