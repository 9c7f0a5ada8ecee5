use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::{
    dedup::{message_fingerprint, DedupCache},
    types::{Metadata, Priority},
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("duplicate message from the same sender")]
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub deduplicate: bool,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            deduplicate: true,
            dedup_capacity: 1000,
            dedup_ttl: Duration::from_secs(300),
        }
    }
}

/// A message waiting to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub content: String,
    pub sender: String,
    pub priority: Priority,
    pub metadata: Metadata,
}

impl OutboundMessage {
    pub fn new(content: impl Into<String>, sender: impl Into<String>, priority: Priority) -> Self {
        Self {
            content: content.into(),
            sender: sender.into(),
            priority,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub priority: Priority,
    /// Insertion order; breaks ties within a priority.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub enqueued_at: Instant,
    pub content: String,
    pub sender: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub utilization_percent: f64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub expired: u64,
    pub peak_size: usize,
    pub priority_histogram: BTreeMap<u8, usize>,
    pub oldest_age_secs: Option<f64>,
    pub newest_age_secs: Option<f64>,
    pub average_age_secs: Option<f64>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
    duplicates: u64,
    expired: u64,
    peak_size: usize,
}

#[derive(Debug)]
struct QueueState {
    len: usize,
    next_sequence: u64,
    buckets: Vec<VecDeque<QueuedMessage>>,
    dedup: DedupCache,
    counters: Counters,
}

impl QueueState {
    fn pop(&mut self) -> Option<QueuedMessage> {
        for bucket in &mut self.buckets {
            if let Some(item) = bucket.pop_front() {
                self.len -= 1;
                self.counters.dequeued += 1;
                return Some(item);
            }
        }
        None
    }

    fn peek(&self) -> Option<&QueuedMessage> {
        self.buckets.iter().find_map(|bucket| bucket.front())
    }

    fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.buckets.iter().flatten()
    }

    /// Keep only items matching `keep`; returns how many were removed.
    fn retain(&mut self, mut keep: impl FnMut(&QueuedMessage) -> bool) -> usize {
        let before = self.len;
        for bucket in &mut self.buckets {
            bucket.retain(&mut keep);
        }
        self.len = self.buckets.iter().map(VecDeque::len).sum();
        before - self.len
    }
}

/// Bounded, thread-safe priority queue: lowest priority value first, FIFO
/// within a priority. `dequeue` blocks on a condition variable.
#[derive(Debug)]
pub struct PriorityMessageQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Default for PriorityMessageQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl PriorityMessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        let buckets = (0..Priority::LEVELS).map(|_| VecDeque::new()).collect();
        let dedup = DedupCache::new(config.dedup_ttl, config.dedup_capacity);
        Self {
            config,
            state: Mutex::new(QueueState {
                len: 0,
                next_sequence: 0,
                buckets,
                dedup,
                counters: Counters::default(),
            }),
            available: Condvar::new(),
        }
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(QueueConfig {
            max_size,
            ..QueueConfig::default()
        })
    }

    /// Insert a message; returns its insertion sequence.
    pub fn enqueue(
        &self,
        content: impl Into<String>,
        sender: impl Into<String>,
        priority: Priority,
        metadata: Metadata,
    ) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let sequence = self.insert_locked(
            &mut state,
            OutboundMessage {
                content: content.into(),
                sender: sender.into(),
                priority,
                metadata,
            },
        )?;
        drop(state);
        self.available.notify_one();
        Ok(sequence)
    }

    fn insert_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        message: OutboundMessage,
    ) -> Result<u64, QueueError> {
        let now = Instant::now();
        let fingerprint = self
            .config
            .deduplicate
            .then(|| message_fingerprint(&message.sender, &message.content));

        if let Some(fingerprint) = &fingerprint {
            if state.dedup.contains(fingerprint, now) {
                state.counters.duplicates += 1;
                tracing::debug!(target = "tmux_relay::queue", sender = %message.sender, "duplicate message rejected");
                return Err(QueueError::Duplicate);
            }
        }
        if state.len >= self.config.max_size {
            state.counters.dropped += 1;
            tracing::warn!(
                target = "tmux_relay::queue",
                sender = %message.sender,
                max_size = self.config.max_size,
                "queue full, message dropped"
            );
            return Err(QueueError::Full);
        }
        if let Some(fingerprint) = &fingerprint {
            state.dedup.insert_if_new(fingerprint, now);
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let idx = message.priority.index();
        state.buckets[idx].push_back(QueuedMessage {
            priority: message.priority,
            sequence,
            timestamp: Utc::now(),
            enqueued_at: now,
            content: message.content,
            sender: message.sender,
            metadata: message.metadata,
        });
        state.len += 1;
        state.counters.enqueued += 1;
        state.counters.peak_size = state.counters.peak_size.max(state.len);
        Ok(sequence)
    }

    /// Enqueue each message; returns how many were accepted.
    pub fn batch_enqueue(&self, messages: impl IntoIterator<Item = OutboundMessage>) -> usize {
        let mut state = self.state.lock();
        let accepted = messages
            .into_iter()
            .map(|message| self.insert_locked(&mut state, message))
            .filter(Result::is_ok)
            .count();
        drop(state);
        if accepted > 0 {
            self.available.notify_all();
        }
        accepted
    }

    /// Remove the highest-priority message, waiting up to `timeout` for one
    /// to arrive. `None` as timeout waits indefinitely.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<QueuedMessage> {
        let mut state = self.state.lock();
        self.wait_for_item(&mut state, timeout);
        state.pop()
    }

    pub fn try_dequeue(&self) -> Option<QueuedMessage> {
        self.state.lock().pop()
    }

    fn wait_for_item(&self, state: &mut MutexGuard<'_, QueueState>, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.len == 0 {
            match deadline {
                None => self.available.wait(state),
                Some(deadline) => {
                    if self.available.wait_until(state, deadline).timed_out() {
                        return;
                    }
                }
            }
        }
    }

    /// Wait for at least one message, then drain up to `max_count` without
    /// further waiting.
    pub fn batch_dequeue(&self, max_count: usize, timeout: Option<Duration>) -> Vec<QueuedMessage> {
        let mut state = self.state.lock();
        self.wait_for_item(&mut state, timeout);
        std::iter::from_fn(|| state.pop()).take(max_count).collect()
    }

    pub fn peek(&self) -> Option<QueuedMessage> {
        self.state.lock().peek().cloned()
    }

    pub fn size(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.config.max_size
    }

    /// Remove everything; returns the number of messages discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let cleared = state.retain(|_| false);
        state.dedup.clear();
        cleared
    }

    pub fn get_messages_by_priority(&self, priority: Priority) -> Vec<QueuedMessage> {
        let state = self.state.lock();
        state.buckets[priority.index()].iter().cloned().collect()
    }

    pub fn get_messages_by_sender(&self, sender: &str) -> Vec<QueuedMessage> {
        let state = self.state.lock();
        state.iter().filter(|m| m.sender == sender).cloned().collect()
    }

    pub fn remove_by_sender(&self, sender: &str) -> usize {
        let removed = self.state.lock().retain(|m| m.sender != sender);
        if removed > 0 {
            tracing::debug!(target = "tmux_relay::queue", sender, removed, "removed queued messages");
        }
        removed
    }

    pub fn expire_old_messages(&self, max_age: Duration) -> usize {
        self.expire_old_messages_at(max_age, Instant::now())
    }

    pub fn expire_old_messages_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut state = self.state.lock();
        let expired = state.retain(|m| now.saturating_duration_since(m.enqueued_at) <= max_age);
        state.counters.expired += expired as u64;
        drop(state);
        if expired > 0 {
            tracing::info!(target = "tmux_relay::queue", expired, "expired stale messages");
            self.available.notify_all();
        }
        expired
    }

    pub fn get_stats(&self) -> QueueStats {
        let now = Instant::now();
        let state = self.state.lock();

        let mut priority_histogram = BTreeMap::new();
        let mut ages = Vec::with_capacity(state.len);
        for message in state.iter() {
            *priority_histogram.entry(message.priority.as_u8()).or_insert(0) += 1;
            ages.push(now.saturating_duration_since(message.enqueued_at).as_secs_f64());
        }
        let average_age_secs = (!ages.is_empty()).then(|| ages.iter().sum::<f64>() / ages.len() as f64);

        QueueStats {
            size: state.len,
            max_size: self.config.max_size,
            utilization_percent: if self.config.max_size == 0 {
                100.0
            } else {
                state.len as f64 / self.config.max_size as f64 * 100.0
            },
            enqueued: state.counters.enqueued,
            dequeued: state.counters.dequeued,
            dropped: state.counters.dropped,
            duplicates: state.counters.duplicates,
            expired: state.counters.expired,
            peak_size: state.counters.peak_size,
            priority_histogram,
            oldest_age_secs: ages.iter().copied().reduce(f64::max),
            newest_age_secs: ages.iter().copied().reduce(f64::min),
            average_age_secs,
        }
    }
}
