use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};

/// Received sequence numbers kept before the oldest range is discarded.
pub const DEFAULT_SEQUENCE_CAPACITY: usize = 10_000;

/// Width of the numeric range dropped from the bottom when trimming.
const SEQUENCE_TRIM_SPAN: u64 = 1_000;

/// Bounded set of seen sequence numbers for duplicate suppression.
///
/// Once more than `capacity` sequences are held, everything below
/// `min + 1000` is discarded. A very old retransmission can therefore be
/// re-admitted; delivery is at-least-once with best-effort suppression.
#[derive(Debug)]
pub struct SequenceWindow {
    capacity: usize,
    seen: BTreeSet<u64>,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SEQUENCE_CAPACITY)
    }
}

impl SequenceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: BTreeSet::new(),
        }
    }

    /// Record `sequence`; returns false if it was already present.
    pub fn insert(&mut self, sequence: u64) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        if self.seen.len() > self.capacity {
            self.trim();
        }
        true
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.seen.contains(&sequence)
    }

    fn trim(&mut self) {
        let Some(&min) = self.seen.first() else {
            return;
        };
        let cutoff = min.saturating_add(SEQUENCE_TRIM_SPAN);
        let before = self.seen.len();
        self.seen = self.seen.split_off(&cutoff);
        tracing::debug!(
            target = "tmux_relay::dedup",
            dropped = before - self.seen.len(),
            cutoff,
            "trimmed received-sequence window"
        );
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Fingerprint of a `(sender, content)` pair for queue deduplication.
pub fn message_fingerprint(sender: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// TTL and size bounded set of string keys, evicted oldest first.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        self.seen.contains_key(id)
    }

    pub fn insert_if_new(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.seen.contains_key(id) {
            return false;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));

        while self.seen.len() > self.max_entries {
            if let Some((old_id, _)) = self.order.pop_front() {
                self.seen.remove(&old_id);
            }
        }

        debug_assert_eq!(
            self.seen.len(),
            self.order.len(),
            "DedupCache: HashMap and VecDeque out of sync"
        );
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, ts)) = self.order.front() {
            if now.saturating_duration_since(*ts) < self.ttl {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
