//! Kafka consumer group via rdkafka.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{BusMessage, EventBus};
use crate::batch::Offsets;
use crate::error::BusError;
use crate::settings::Settings;

/// After the first message arrives, keep draining the local queue for this long.
const FETCH_LINGER: Duration = Duration::from_millis(50);

pub struct KafkaBus {
    consumer: StreamConsumer,
}

impl KafkaBus {
    pub fn new(settings: &Settings) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.kafka_brokers)
            .set("group.id", &settings.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .create()?;
        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(
            brokers = %settings.kafka_brokers,
            group = %settings.consumer_group,
            ?topics,
            "kafka consumer subscribed"
        );
        Ok(KafkaBus { consumer })
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<BusMessage>, BusError> {
        let mut messages = Vec::new();
        let deadline = Instant::now() + timeout;
        while messages.len() < max_records {
            let wait = if messages.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + FETCH_LINGER)
            };
            match tokio::time::timeout_at(wait, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if messages.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(error = %e, received = messages.len(), "receiving message, returning partial poll");
                    break;
                }
                Ok(Ok(msg)) => messages.push(BusMessage {
                    topic: msg.topic().to_owned(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    payload: msg.payload().map(<[u8]>::to_vec),
                }),
            }
        }
        Ok(messages)
    }

    async fn commit(&mut self, offsets: &Offsets) -> Result<(), BusError> {
        if offsets.is_empty() {
            return Ok(());
        }
        // committing _next_ message offset as per https://docs.rs/rdkafka/latest/rdkafka/consumer/trait.Consumer.html#tymethod.commit
        let topic_map: HashMap<(String, i32), Offset> = offsets
            .iter()
            .map(|(k, high)| (k.clone(), Offset::Offset(high + 1)))
            .collect();
        let tpl = TopicPartitionList::from_topic_map(&topic_map)?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!("kafka consumer unsubscribed");
    }
}
