//! Message bus the events are consumed from.
pub mod kafka;

use std::time::Duration;

use async_trait::async_trait;

use crate::batch::Offsets;
use crate::error::BusError;

/// Consumed message, detached from the client that fetched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

#[async_trait]
pub trait EventBus: Send {
    /// Returns up to `max_records` messages, waiting at most `timeout` for the first one.
    /// An empty vector means nothing arrived in time.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<BusMessage>, BusError>;

    /// Marks everything up to and including the given offsets as processed.
    async fn commit(&mut self, offsets: &Offsets) -> Result<(), BusError>;

    /// Leaves the consumer group.
    async fn close(&mut self);
}
