//! Reassembly of chunked messages delivered in arbitrary order.
//!
//! Buffers are keyed by `message_id` and removed exactly once: either when
//! every index `0..total` has arrived, or when a timeout sweep evicts them.
//! Sweeps are explicit; callers run [`ChunkReassembler::check_timeouts`]
//! from their own scheduler tick.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::chunking::Fragment;

pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Completed-message metadata retained for diagnostics.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug)]
struct ReassemblyBuffer {
    sender: String,
    total: usize,
    chunks: BTreeMap<usize, String>,
    first_seen: Instant,
    last_seen: Instant,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total
    }

    fn missing(&self) -> Vec<usize> {
        (0..self.total)
            .filter(|idx| !self.chunks.contains_key(idx))
            .collect()
    }

    fn assemble(&self) -> String {
        self.chunks
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }
}

/// Metadata about a reassembled message.
#[derive(Debug, Clone, Serialize)]
pub struct ReassembledMessage {
    pub message_id: String,
    pub sender: String,
    pub chunk_count: usize,
    pub length: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Diagnostic view of a partially received message.
#[derive(Debug, Clone, Serialize)]
pub struct IncompleteMessage {
    pub message_id: String,
    pub sender: String,
    pub received: usize,
    pub total: usize,
    pub missing: Vec<usize>,
    pub age_secs: f64,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub chunks_received: u64,
    pub messages_reassembled: u64,
    pub standard_messages: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub active_buffers: usize,
}

#[derive(Debug, Default)]
struct ReassemblerState {
    buffers: HashMap<String, ReassemblyBuffer>,
    history: VecDeque<ReassembledMessage>,
    stats: ReassemblyStats,
}

#[derive(Debug)]
pub struct ChunkReassembler {
    timeout: Duration,
    state: Mutex<ReassemblerState>,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

impl ChunkReassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(ReassemblerState::default()),
        }
    }

    /// Accept an untrusted JSON fragment. Malformed input counts as an error.
    pub fn add_value(&self, value: &Value) -> Option<String> {
        match Fragment::from_value(value) {
            Ok(fragment) => self.add_chunk_at(fragment, Instant::now()),
            Err(error) => {
                tracing::debug!(target = "tmux_relay::reassembly", %error, "rejected fragment");
                self.state.lock().stats.errors += 1;
                None
            }
        }
    }

    pub fn add_chunk(&self, fragment: Fragment) -> Option<String> {
        self.add_chunk_at(fragment, Instant::now())
    }

    /// Store `fragment`; returns the full message once the final missing
    /// index arrives.
    pub fn add_chunk_at(&self, fragment: Fragment, now: Instant) -> Option<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Err(error) = fragment.validate() {
            tracing::debug!(target = "tmux_relay::reassembly", %error, "rejected fragment");
            state.stats.errors += 1;
            return None;
        }
        state.stats.chunks_received += 1;

        let (message_id, chunk_index, total_chunks, sender, content) = match fragment {
            Fragment::Standard { content, .. } => {
                state.stats.standard_messages += 1;
                return Some(content);
            }
            Fragment::Chunked {
                message_id,
                chunk_index,
                total_chunks,
                sender,
                content,
                ..
            } => (message_id, chunk_index, total_chunks, sender, content),
        };

        let buffer = state
            .buffers
            .entry(message_id.clone())
            .or_insert_with(|| ReassemblyBuffer {
                sender,
                total: total_chunks,
                chunks: BTreeMap::new(),
                first_seen: now,
                last_seen: now,
            });

        if buffer.total != total_chunks {
            tracing::warn!(
                target = "tmux_relay::reassembly",
                message_id = %message_id,
                expected = buffer.total,
                got = total_chunks,
                "fragment disagrees on total_chunks"
            );
            state.stats.errors += 1;
            return None;
        }

        // Retransmissions overwrite; content is identical in practice.
        buffer.chunks.insert(chunk_index, content);
        buffer.last_seen = now;

        if !buffer.is_complete() {
            return None;
        }

        let buffer = state.buffers.remove(&message_id)?;
        let message = buffer.assemble();
        let record = ReassembledMessage {
            message_id,
            sender: buffer.sender,
            chunk_count: buffer.total,
            length: message.chars().count(),
            duration_ms: now.saturating_duration_since(buffer.first_seen).as_millis() as u64,
            completed_at: Utc::now(),
        };
        tracing::debug!(
            target = "tmux_relay::reassembly",
            message_id = %record.message_id,
            chunks = record.chunk_count,
            duration_ms = record.duration_ms,
            "message reassembled"
        );

        state.stats.messages_reassembled += 1;
        state.history.push_back(record);
        if state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        Some(message)
    }

    pub fn check_timeouts(&self) -> Vec<String> {
        self.check_timeouts_at(Instant::now())
    }

    /// Evict buffers first seen more than `timeout` ago; returns their ids.
    pub fn check_timeouts_at(&self, now: Instant) -> Vec<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let expired: Vec<String> = state
            .buffers
            .iter()
            .filter(|(_, buffer)| now.saturating_duration_since(buffer.first_seen) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(buffer) = state.buffers.remove(id) {
                tracing::warn!(
                    target = "tmux_relay::reassembly",
                    message_id = %id,
                    sender = %buffer.sender,
                    received = buffer.chunks.len(),
                    total = buffer.total,
                    "dropping incomplete message after timeout"
                );
            }
            state.stats.timeouts += 1;
            state.stats.errors += 1;
        }
        expired
    }

    pub fn get_incomplete_messages(&self) -> Vec<IncompleteMessage> {
        self.get_incomplete_messages_at(Instant::now())
    }

    pub fn get_incomplete_messages_at(&self, now: Instant) -> Vec<IncompleteMessage> {
        let state = self.state.lock();
        let mut incomplete: Vec<IncompleteMessage> = state
            .buffers
            .iter()
            .map(|(id, buffer)| IncompleteMessage {
                message_id: id.clone(),
                sender: buffer.sender.clone(),
                received: buffer.chunks.len(),
                total: buffer.total,
                missing: buffer.missing(),
                age_secs: now.saturating_duration_since(buffer.first_seen).as_secs_f64(),
                idle_secs: now.saturating_duration_since(buffer.last_seen).as_secs_f64(),
            })
            .collect();
        incomplete.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        incomplete
    }

    pub fn get_stats(&self) -> ReassemblyStats {
        let state = self.state.lock();
        ReassemblyStats {
            active_buffers: state.buffers.len(),
            ..state.stats.clone()
        }
    }

    /// Most recent completions, newest last.
    pub fn get_reassembled_history(&self, limit: usize) -> Vec<ReassembledMessage> {
        let state = self.state.lock();
        let start = state.history.len().saturating_sub(limit);
        state.history.iter().skip(start).cloned().collect()
    }

    /// Drop all partial buffers and history; returns the number of buffers dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.buffers.len();
        state.buffers.clear();
        state.history.clear();
        dropped
    }
}
