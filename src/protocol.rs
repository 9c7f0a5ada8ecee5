//! Reliable delivery over a best-effort terminal transport.
//!
//! Every envelope carries a per-instance sequence number. Non-control
//! envelopes are tracked until acknowledged; retries and failures are
//! bookkept here while the caller decides when to resend. Inbound
//! duplicates are suppressed through a bounded [`SequenceWindow`] per
//! sender, since every peer numbers its own envelopes from 1.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dedup::SequenceWindow,
    error::RelayError,
    types::{Metadata, Priority},
};

pub const ENVELOPE_PREFIX: &str = "[[EMP:";
pub const ENVELOPE_SUFFIX: &str = ":EMP]]";

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const REQUIRED_FIELDS: [&str; 4] = ["sequence", "type", "sender", "content"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Standard,
    Chunked,
    Ack,
    Nack,
    Heartbeat,
    Status,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Standard => "standard",
            MessageType::Chunked => "chunked",
            MessageType::Ack => "ack",
            MessageType::Nack => "nack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "standard" => MessageType::Standard,
            "chunked" => MessageType::Chunked,
            "ack" => MessageType::Ack,
            "nack" => MessageType::Nack,
            "heartbeat" => MessageType::Heartbeat,
            "status" => MessageType::Status,
            "error" => MessageType::Error,
            _ => return None,
        })
    }

    /// Acks and nacks are never themselves awaiting acknowledgment.
    pub fn is_control_reply(self) -> bool {
        matches!(self, MessageType::Ack | MessageType::Nack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nack_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("sequence must be a non-negative integer")]
    InvalidSequence,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("field `{0}` must be a string")]
    NotAString(&'static str),
}

/// Check required fields and their types on an untrusted envelope.
pub fn validate_message(value: &Value) -> Result<(), EnvelopeError> {
    let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            return Err(EnvelopeError::MissingField(field));
        }
    }
    if obj.get("sequence").and_then(Value::as_u64).is_none() {
        return Err(EnvelopeError::InvalidSequence);
    }
    let msg_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::NotAString("type"))?;
    if MessageType::parse(msg_type).is_none() {
        return Err(EnvelopeError::UnknownType(msg_type.to_string()));
    }
    for field in ["sender", "content"] {
        if !obj.get(field).is_some_and(Value::is_string) {
            return Err(EnvelopeError::NotAString(field));
        }
    }
    Ok(())
}

pub fn encode_message(envelope: &Envelope) -> Result<String, RelayError> {
    let payload = serde_json::to_string(envelope)?;
    Ok(format!("{ENVELOPE_PREFIX}{payload}{ENVELOPE_SUFFIX}"))
}

/// Decode a wrapped envelope, or a bare JSON object for older senders.
/// Returns `None` for anything that fails to parse or validate.
pub fn decode_message(raw: &str) -> Option<Envelope> {
    let payload = match unwrap_markers(raw) {
        Some(inner) => inner,
        None => raw.trim(),
    };
    let value: Value = serde_json::from_str(payload).ok()?;
    if let Err(error) = validate_message(&value) {
        tracing::debug!(target = "tmux_relay::protocol", %error, "discarding invalid envelope");
        return None;
    }
    serde_json::from_value(value).ok()
}

fn unwrap_markers(raw: &str) -> Option<&str> {
    let start = raw.find(ENVELOPE_PREFIX)? + ENVELOPE_PREFIX.len();
    let end = raw.rfind(ENVELOPE_SUFFIX)?;
    (start <= end).then(|| &raw[start..end])
}

/// Outcome of feeding an ACK or NACK to the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked(u64),
    Nacked { sequence: u64, reason: Option<String> },
}

impl AckOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, AckOutcome::Acked(_))
    }

    pub fn sequence(&self) -> u64 {
        match self {
            AckOutcome::Acked(sequence) | AckOutcome::Nacked { sequence, .. } => *sequence,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingAck {
    envelope: Envelope,
    sent_at: Instant,
    attempts: u32,
}

/// Read-only view of an envelope awaiting acknowledgment.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub sequence: u64,
    pub msg_type: MessageType,
    pub attempts: u32,
    pub age_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    pub sent: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retried: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct ProtocolState {
    pending: BTreeMap<u64, PendingAck>,
    received: HashMap<String, SequenceWindow>,
    stats: ProtocolStats,
}

#[derive(Debug)]
pub struct ReliableProtocol {
    max_retries: u32,
    next_sequence: AtomicU64,
    state: Mutex<ProtocolState>,
}

impl Default for ReliableProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl ReliableProtocol {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            next_sequence: AtomicU64::new(0),
            state: Mutex::new(ProtocolState::default()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn envelope(
        &self,
        content: String,
        sender: &str,
        msg_type: MessageType,
        priority: Priority,
        metadata: Metadata,
    ) -> Envelope {
        Envelope {
            sequence: self.allocate_sequence(),
            msg_type,
            sender: sender.to_string(),
            content,
            priority,
            timestamp: Utc::now().to_rfc3339(),
            retry_count: 0,
            metadata,
            ack_sequence: None,
            nack_sequence: None,
            reason: None,
        }
    }

    pub fn prepare_message(
        &self,
        content: impl Into<String>,
        sender: &str,
        msg_type: MessageType,
        priority: Priority,
        metadata: Metadata,
    ) -> Envelope {
        let envelope = self.envelope(content.into(), sender, msg_type, priority, metadata);
        self.track(&envelope, Instant::now());
        envelope
    }

    fn track(&self, envelope: &Envelope, now: Instant) {
        let mut state = self.state.lock();
        state.stats.sent += 1;
        if envelope.msg_type.is_control_reply() {
            return;
        }
        state.pending.insert(
            envelope.sequence,
            PendingAck {
                envelope: envelope.clone(),
                sent_at: now,
                attempts: 1,
            },
        );
    }

    pub fn create_ack(&self, sequence: u64, sender: &str) -> Envelope {
        let mut envelope = self.envelope(
            format!("ack:{sequence}"),
            sender,
            MessageType::Ack,
            Priority::HIGHEST,
            Metadata::new(),
        );
        envelope.ack_sequence = Some(sequence);
        self.track(&envelope, Instant::now());
        envelope
    }

    pub fn create_nack(&self, sequence: u64, sender: &str, reason: &str) -> Envelope {
        let mut envelope = self.envelope(
            format!("nack:{sequence}"),
            sender,
            MessageType::Nack,
            Priority::HIGHEST,
            Metadata::new(),
        );
        envelope.nack_sequence = Some(sequence);
        envelope.reason = Some(reason.to_string());
        self.track(&envelope, Instant::now());
        envelope
    }

    pub fn create_heartbeat(&self, sender: &str) -> Envelope {
        self.prepare_message(
            "heartbeat",
            sender,
            MessageType::Heartbeat,
            Priority::HIGHEST,
            Metadata::new(),
        )
    }

    pub fn create_status(&self, sender: &str, status: &Value) -> Envelope {
        self.prepare_message(
            status.to_string(),
            sender,
            MessageType::Status,
            Priority::HIGH,
            Metadata::new(),
        )
    }

    /// Apply an inbound ACK/NACK. Returns `None` for any other envelope.
    pub fn process_acknowledgment(&self, envelope: &Envelope) -> Option<AckOutcome> {
        let mut state = self.state.lock();
        match envelope.msg_type {
            MessageType::Ack => {
                let sequence = envelope.ack_sequence?;
                if state.pending.remove(&sequence).is_some() {
                    state.stats.acked += 1;
                } else {
                    tracing::debug!(
                        target = "tmux_relay::protocol",
                        sequence,
                        "ack for unknown or already settled sequence"
                    );
                }
                Some(AckOutcome::Acked(sequence))
            }
            MessageType::Nack => {
                let sequence = envelope.nack_sequence?;
                state.stats.nacked += 1;
                Some(AckOutcome::Nacked {
                    sequence,
                    reason: envelope.reason.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn should_retry(&self, sequence: u64) -> bool {
        let state = self.state.lock();
        state
            .pending
            .get(&sequence)
            .is_some_and(|pending| pending.attempts < self.max_retries)
    }

    pub fn mark_retry(&self, sequence: u64) -> Option<Envelope> {
        self.mark_retry_at(sequence, Instant::now())
    }

    /// Count another attempt and return the envelope to resend, or `None`
    /// once retries are exhausted (the entry is then dropped as failed).
    pub fn mark_retry_at(&self, sequence: u64, now: Instant) -> Option<Envelope> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pending = state.pending.get_mut(&sequence)?;

        if pending.attempts >= self.max_retries {
            state.pending.remove(&sequence);
            state.stats.failed += 1;
            tracing::warn!(
                target = "tmux_relay::protocol",
                sequence,
                max_retries = self.max_retries,
                "delivery failed after retries"
            );
            return None;
        }

        pending.attempts += 1;
        pending.envelope.retry_count += 1;
        pending.sent_at = now;
        let envelope = pending.envelope.clone();
        state.stats.retried += 1;
        Some(envelope)
    }

    pub fn check_pending_timeouts(&self, timeout: Duration) -> Vec<u64> {
        self.check_pending_timeouts_at(timeout, Instant::now())
    }

    /// Sequences whose last send is older than `timeout`. Entries that can
    /// no longer be retried are removed and counted as failed.
    pub fn check_pending_timeouts_at(&self, timeout: Duration, now: Instant) -> Vec<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let timed_out: Vec<(u64, u32)> = state
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.sent_at) > timeout)
            .map(|(seq, pending)| (*seq, pending.attempts))
            .collect();

        for &(sequence, attempts) in &timed_out {
            if attempts >= self.max_retries {
                state.pending.remove(&sequence);
                state.stats.failed += 1;
                tracing::warn!(
                    target = "tmux_relay::protocol",
                    sequence,
                    attempts,
                    "acknowledgment timed out, giving up"
                );
            }
        }
        timed_out.into_iter().map(|(sequence, _)| sequence).collect()
    }

    /// Record `(envelope.sender, envelope.sequence)` as received; true if
    /// that sender's sequence was seen before.
    pub fn is_duplicate(&self, envelope: &Envelope) -> bool {
        let mut state = self.state.lock();
        let duplicate = !state
            .received
            .entry(envelope.sender.clone())
            .or_default()
            .insert(envelope.sequence);
        if duplicate {
            state.stats.duplicates += 1;
        }
        duplicate
    }

    pub fn get_pending_messages(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .pending
            .iter()
            .map(|(sequence, pending)| PendingSummary {
                sequence: *sequence,
                msg_type: pending.envelope.msg_type,
                attempts: pending.attempts,
                age_secs: now.saturating_duration_since(pending.sent_at).as_secs_f64(),
            })
            .collect()
    }

    pub fn get_stats(&self) -> ProtocolStats {
        let state = self.state.lock();
        ProtocolStats {
            pending: state.pending.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;
    use serde_json::json;

    fn send(protocol: &ReliableProtocol, content: &str) -> Envelope {
        protocol.prepare_message(
            content,
            "lead",
            MessageType::Standard,
            Priority::NORMAL,
            Metadata::new(),
        )
    }

    #[test]
    fn sequences_increase_across_message_kinds() {
        let protocol = ReliableProtocol::default();
        let a = send(&protocol, "a");
        let ack = protocol.create_ack(99, "worker");
        let hb = protocol.create_heartbeat("lead");
        assert_eq!((a.sequence, ack.sequence, hb.sequence), (1, 2, 3));
    }

    #[test]
    fn acks_are_not_tracked() {
        let protocol = ReliableProtocol::default();
        send(&protocol, "a");
        protocol.create_ack(1, "lead");
        protocol.create_nack(1, "lead", "garbled");
        let stats = protocol.get_stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn ack_clears_pending_nack_keeps_it() {
        let sender = ReliableProtocol::default();
        let receiver = ReliableProtocol::default();
        let env = send(&sender, "hello");

        let nack = receiver.create_nack(env.sequence, "worker", "busy");
        let outcome = sender.process_acknowledgment(&nack).unwrap();
        assert!(!outcome.is_ack());
        assert_eq!(outcome.sequence(), env.sequence);
        assert_eq!(sender.get_pending_messages().len(), 1);

        let ack = receiver.create_ack(env.sequence, "worker");
        assert_eq!(
            sender.process_acknowledgment(&ack),
            Some(AckOutcome::Acked(env.sequence))
        );
        let stats = sender.get_stats();
        assert_eq!((stats.acked, stats.nacked, stats.pending), (1, 1, 0));

        assert!(sender.process_acknowledgment(&env).is_none());
    }

    #[test]
    fn retry_exhaustion_marks_failed() {
        let protocol = ReliableProtocol::new(3);
        let env = send(&protocol, "hello");
        assert!(protocol.should_retry(env.sequence));

        let first = protocol.mark_retry(env.sequence).unwrap();
        assert_eq!(first.retry_count, 1);
        let second = protocol.mark_retry(env.sequence).unwrap();
        assert_eq!(second.retry_count, 2);
        assert!(!protocol.should_retry(env.sequence));

        assert!(protocol.mark_retry(env.sequence).is_none());
        let stats = protocol.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 2);
        assert!(protocol
            .get_pending_messages()
            .iter()
            .all(|p| p.sequence != env.sequence));
    }

    #[test]
    fn pending_timeouts_fail_only_exhausted_entries() {
        let protocol = ReliableProtocol::new(2);
        let start = Instant::now();
        let fresh = send(&protocol, "fresh");
        let tired = send(&protocol, "tired");
        protocol.mark_retry_at(tired.sequence, start);

        let later = start + Duration::from_secs(60);
        let timed_out = protocol.check_pending_timeouts_at(Duration::from_secs(30), later);
        assert_eq!(timed_out, vec![fresh.sequence, tired.sequence]);

        assert!(protocol.should_retry(fresh.sequence));
        assert!(!protocol.should_retry(tired.sequence));
        assert_eq!(protocol.get_stats().failed, 1);
        assert_eq!(protocol.get_stats().pending, 1);
    }

    #[test]
    fn duplicate_detection() {
        let protocol = ReliableProtocol::default();
        let env = send(&protocol, "hello");
        assert!(!protocol.is_duplicate(&env));
        assert!(protocol.is_duplicate(&env));
        assert!(protocol.is_duplicate(&env));
        assert_eq!(protocol.get_stats().duplicates, 2);
    }

    #[test]
    fn same_sequence_from_different_senders_is_not_a_duplicate() {
        let receiver = ReliableProtocol::default();
        let from_alice = ReliableProtocol::default().prepare_message(
            "hi from alice",
            "alice",
            MessageType::Standard,
            Priority::NORMAL,
            Metadata::new(),
        );
        let from_carol = ReliableProtocol::default().prepare_message(
            "hi from carol",
            "carol",
            MessageType::Standard,
            Priority::NORMAL,
            Metadata::new(),
        );
        assert_eq!(from_alice.sequence, from_carol.sequence);

        assert!(!receiver.is_duplicate(&from_alice));
        assert!(!receiver.is_duplicate(&from_carol));
        assert!(receiver.is_duplicate(&from_carol));
        assert_eq!(receiver.get_stats().duplicates, 1);
    }

    #[test]
    fn wire_round_trip_with_wrapper() {
        let protocol = ReliableProtocol::default();
        let mut metadata = Metadata::new();
        metadata.insert("thread".into(), json!("t-1"));
        let env = protocol.prepare_message(
            "body with :EMP]] inside",
            "lead",
            MessageType::Chunked,
            Priority::HIGH,
            metadata,
        );
        let wire = encode_message(&env).unwrap();
        assert!(wire.starts_with(ENVELOPE_PREFIX));
        assert!(wire.ends_with(ENVELOPE_SUFFIX));

        let noisy = format!("$ echo\n{wire}\n> ");
        assert_eq!(decode_message(&noisy), Some(env));
    }

    #[test]
    fn decode_accepts_bare_json() {
        let raw = r#"{"sequence": 7, "type": "status", "sender": "w", "content": "ok"}"#;
        let env = decode_message(raw).unwrap();
        assert_eq!(env.sequence, 7);
        assert_eq!(env.msg_type, MessageType::Status);
        assert_eq!(env.priority, Priority::NORMAL);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message("not json").is_none());
        assert!(decode_message("[[EMP:{broken:EMP]]").is_none());
        assert!(decode_message(r#"{"sequence": 1, "type": "standard", "sender": "w"}"#).is_none());
        assert!(decode_message(r#"{"sequence": -1, "type": "standard", "sender": "w", "content": ""}"#).is_none());
        assert!(decode_message(r#"{"sequence": 1, "type": "weird", "sender": "w", "content": ""}"#).is_none());
    }

    #[test]
    fn validate_reports_specific_errors() {
        assert_eq!(validate_message(&json!([])), Err(EnvelopeError::NotAnObject));
        assert_eq!(
            validate_message(&json!({"type": "ack", "sender": "a", "content": ""})),
            Err(EnvelopeError::MissingField("sequence"))
        );
        assert_eq!(
            validate_message(&json!({"sequence": "1", "type": "ack", "sender": "a", "content": ""})),
            Err(EnvelopeError::InvalidSequence)
        );
        assert_eq!(
            validate_message(&json!({"sequence": 1, "type": "bogus", "sender": "a", "content": ""})),
            Err(EnvelopeError::UnknownType("bogus".into()))
        );
        assert!(validate_message(&json!({"sequence": 1, "type": "ack", "sender": "a", "content": ""})).is_ok());
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        let protocol = Arc::new(ReliableProtocol::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let protocol = Arc::clone(&protocol);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|i| {
                            if i % 2 == 0 {
                                protocol.create_heartbeat("t").sequence
                            } else {
                                protocol.create_ack(i, "t").sequence
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "sequence {seq} allocated twice");
            }
        }
        assert_eq!(seen.len(), 2_000);
    }
}
