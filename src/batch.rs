//! Batching of parsed events between the bus and the sink.
use std::collections::{hash_map, HashMap};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::schema::Event;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Highest consumed offset per (topic, partition).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Offsets(HashMap<(String, i32), i64>);

impl Offsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `offset` was consumed, keeping the high watermark.
    pub fn observe(&mut self, topic: &str, partition: i32, offset: i64) {
        let high = self.0.entry((topic.to_owned(), partition)).or_insert(offset);
        if *high < offset {
            *high = offset;
        }
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.0.get(&(topic.to_owned(), partition)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, (String, i32), i64> {
        self.0.iter()
    }
}

/// Unit of work handed to the router: flushed as a whole or not at all.
#[derive(Debug, Clone)]
pub struct Batch {
    /// correlates log lines across flush retries
    pub id: Uuid,
    pub events: Vec<Event>,
    pub offsets: Offsets,
}

impl Batch {
    fn new(events: Vec<Event>, offsets: Offsets) -> Self {
        Batch {
            id: Uuid::new_v4(),
            events,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffers events until `capacity` is reached.
///
/// Only the ingester loop touches it, so it takes `&mut self` and does no locking.
#[derive(Debug)]
pub struct Accumulator {
    capacity: usize,
    events: Vec<Event>,
    offsets: Offsets,
    started: Option<Instant>,
}

impl Accumulator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Accumulator {
            capacity,
            events: Vec::with_capacity(capacity),
            offsets: Offsets::new(),
            started: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Holds `event`; returns the completed batch once capacity is reached.
    pub fn append(&mut self, event: Event, topic: &str, partition: i32, offset: i64) -> Option<Batch> {
        self.observe(topic, partition, offset);
        self.events.push(event);
        if self.events.len() >= self.capacity {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Records a consumed message that produced no event, so the cursor can move past it
    /// together with the batch it arrived in.
    pub fn skip(&mut self, topic: &str, partition: i32, offset: i64) {
        self.observe(topic, partition, offset);
    }

    /// Hands out whatever is held, possibly an empty batch.
    pub fn drain(&mut self) -> Batch {
        self.started = None;
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.capacity));
        Batch::new(events, std::mem::take(&mut self.offsets))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// True if anything, event or skipped offset, awaits a flush.
    pub fn has_pending(&self) -> bool {
        !self.events.is_empty() || !self.offsets.is_empty()
    }

    /// Time since the first pending message arrived.
    pub fn age(&self) -> Option<Duration> {
        self.started.map(|t| t.elapsed())
    }

    fn observe(&mut self, topic: &str, partition: i32, offset: i64) {
        self.started.get_or_insert_with(Instant::now);
        self.offsets.observe(topic, partition, offset);
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Accumulator::new(DEFAULT_BATCH_SIZE)
    }
}
