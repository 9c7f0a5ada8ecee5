//! End-to-end message pipeline for one agent identity.
//!
//! Outbound: text is chunked, each fragment wrapped in a sequenced envelope,
//! encoded and queued by priority; [`Messenger::flush`] drains the queue
//! into a terminal pane. Inbound: [`Messenger::receive`] decodes, settles
//! acks, suppresses duplicates and reassembles fragments. [`Messenger::tick`]
//! is the periodic sweep that drives retries and timeouts.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    chunking::{ChunkCodec, Fragment, DEFAULT_CHUNK_SIZE},
    error::RelayError,
    performance::{PerformanceAlert, PerformanceMonitor, PerformanceSnapshot, PerformanceThresholds},
    protocol::{
        decode_message, encode_message, AckOutcome, Envelope, MessageType, ProtocolStats,
        ReliableProtocol, DEFAULT_MAX_RETRIES,
    },
    queue::{PriorityMessageQueue, QueueConfig, QueueError, QueueStats},
    reassembly::{ChunkReassembler, ReassemblyStats, DEFAULT_REASSEMBLY_TIMEOUT},
    target::AgentTarget,
    terminal::TerminalAdapter,
    types::{Metadata, Priority},
};

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub chunk_size: usize,
    pub queue: QueueConfig,
    pub max_retries: u32,
    /// How long a sent envelope may wait for its ACK before a retry.
    pub ack_timeout: Duration,
    pub reassembly_timeout: Duration,
    /// Queued wire messages older than this are dropped on `tick`.
    pub max_queue_age: Duration,
    /// Checked against the rolling performance window on every `tick`.
    pub performance_thresholds: PerformanceThresholds,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue: QueueConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            ack_timeout: Duration::from_secs(30),
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_queue_age: Duration::from_secs(600),
            performance_thresholds: PerformanceThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Sequences of envelopes accepted by the queue, in fragment order.
    pub queued: Vec<u64>,
    pub rejected: Vec<(u64, QueueError)>,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
}

/// What an inbound wire message turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A complete message, either standard or fully reassembled.
    Message { sender: String, content: String },
    /// A fragment was stored; the message is still incomplete.
    Partial { sender: String },
    Duplicate { sequence: u64 },
    Control(AckOutcome),
    Heartbeat { sender: String },
    Status { sender: String, status: Value },
    Error { sender: String, content: String },
    /// Undecodable input or a malformed fragment.
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub inbound: Inbound,
    /// Acknowledgment to send back to the peer, if one is owed.
    pub ack: Option<Envelope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub retried: Vec<u64>,
    pub failed: Vec<u64>,
    pub reassembly_timeouts: Vec<String>,
    pub expired: usize,
    pub alerts: Vec<PerformanceAlert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessengerStats {
    pub protocol: ProtocolStats,
    pub queue: QueueStats,
    pub reassembly: ReassemblyStats,
    pub performance: PerformanceSnapshot,
    pub decode_failures: u64,
}

#[derive(Debug)]
pub struct Messenger {
    identity: String,
    config: MessengerConfig,
    codec: ChunkCodec,
    protocol: ReliableProtocol,
    queue: PriorityMessageQueue,
    reassembler: ChunkReassembler,
    performance: PerformanceMonitor,
    decode_failures: AtomicU64,
}

impl Messenger {
    pub fn new(identity: impl Into<String>, config: MessengerConfig) -> Self {
        Self {
            identity: identity.into(),
            codec: ChunkCodec::new(config.chunk_size),
            protocol: ReliableProtocol::new(config.max_retries),
            queue: PriorityMessageQueue::new(config.queue.clone()),
            reassembler: ChunkReassembler::new(config.reassembly_timeout),
            performance: PerformanceMonitor::default(),
            decode_failures: AtomicU64::new(0),
            config,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn protocol(&self) -> &ReliableProtocol {
        &self.protocol
    }

    pub fn queue(&self) -> &PriorityMessageQueue {
        &self.queue
    }

    pub fn reassembler(&self) -> &ChunkReassembler {
        &self.reassembler
    }

    pub fn performance(&self) -> &PerformanceMonitor {
        &self.performance
    }

    /// Chunk `content`, wrap each fragment in an envelope and queue it.
    pub fn send(
        &self,
        content: &str,
        priority: Priority,
        metadata: Metadata,
    ) -> Result<SendReport, RelayError> {
        let mut report = SendReport::default();
        for fragment in self.codec.chunk_message(content, &self.identity) {
            let msg_type = if fragment.is_chunked() {
                MessageType::Chunked
            } else {
                MessageType::Standard
            };
            let body = serde_json::to_string(&fragment)?;
            let envelope =
                self.protocol
                    .prepare_message(body, &self.identity, msg_type, priority, metadata.clone());
            self.enqueue_envelope(&envelope, &mut report)?;
        }
        Ok(report)
    }

    pub fn send_heartbeat(&self) -> Result<SendReport, RelayError> {
        let envelope = self.protocol.create_heartbeat(&self.identity);
        let mut report = SendReport::default();
        self.enqueue_envelope(&envelope, &mut report)?;
        Ok(report)
    }

    pub fn send_status(&self, status: &Value) -> Result<SendReport, RelayError> {
        let envelope = self.protocol.create_status(&self.identity, status);
        let mut report = SendReport::default();
        self.enqueue_envelope(&envelope, &mut report)?;
        Ok(report)
    }

    fn enqueue_envelope(&self, envelope: &Envelope, report: &mut SendReport) -> Result<(), RelayError> {
        let wire = encode_message(envelope)?;
        let mut meta = Metadata::new();
        meta.insert("sequence".into(), envelope.sequence.into());
        meta.insert("type".into(), envelope.msg_type.as_str().into());

        match self
            .queue
            .enqueue(wire, self.identity.as_str(), envelope.priority, meta)
        {
            Ok(_) => report.queued.push(envelope.sequence),
            Err(err) => {
                tracing::warn!(
                    target = "tmux_relay::messenger",
                    sequence = envelope.sequence,
                    error = %err,
                    "envelope not queued"
                );
                self.performance.record_error("queue");
                report.rejected.push((envelope.sequence, err));
            }
        }
        Ok(())
    }

    /// Deliver up to `max` queued wire messages to `to`, highest priority
    /// first.
    pub async fn flush<A: TerminalAdapter>(&self, terminal: &A, to: &AgentTarget, max: usize) -> FlushReport {
        let mut report = FlushReport::default();
        for _ in 0..max {
            let Some(message) = self.queue.try_dequeue() else {
                break;
            };
            let started = Instant::now();
            match terminal.send_message(to, &message.content).await {
                Ok(true) => {
                    self.performance.record_latency(started.elapsed());
                    report.delivered += 1;
                }
                Ok(false) => {
                    self.performance.record_error("send_rejected");
                    report.failed += 1;
                }
                Err(err) => {
                    tracing::warn!(target = "tmux_relay::messenger", to = %to, error = %err, "delivery failed");
                    self.performance.record_error("send");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Process one inbound wire message.
    pub fn receive(&self, raw: &str) -> Received {
        let Some(envelope) = decode_message(raw) else {
            self.decode_failures.fetch_add(1, Ordering::Relaxed);
            self.performance.record_error("decode");
            return Received {
                inbound: Inbound::Invalid,
                ack: None,
            };
        };

        if envelope.msg_type.is_control_reply() {
            let inbound = match self.protocol.process_acknowledgment(&envelope) {
                Some(outcome) => Inbound::Control(outcome),
                None => Inbound::Invalid,
            };
            return Received { inbound, ack: None };
        }

        let ack = Some(self.protocol.create_ack(envelope.sequence, &self.identity));
        if self.protocol.is_duplicate(&envelope) {
            return Received {
                inbound: Inbound::Duplicate {
                    sequence: envelope.sequence,
                },
                ack,
            };
        }

        let inbound = match envelope.msg_type {
            MessageType::Standard | MessageType::Chunked => self.accept_fragment(envelope),
            MessageType::Heartbeat => Inbound::Heartbeat {
                sender: envelope.sender,
            },
            MessageType::Status => Inbound::Status {
                status: serde_json::from_str(&envelope.content).unwrap_or(Value::String(envelope.content)),
                sender: envelope.sender,
            },
            MessageType::Error => Inbound::Error {
                sender: envelope.sender,
                content: envelope.content,
            },
            MessageType::Ack | MessageType::Nack => Inbound::Invalid,
        };
        Received { inbound, ack }
    }

    fn accept_fragment(&self, envelope: Envelope) -> Inbound {
        let value = match serde_json::from_str::<Value>(&envelope.content) {
            Ok(value) if value.is_object() => value,
            // Peers that do not chunk send plain text bodies.
            _ => {
                return Inbound::Message {
                    sender: envelope.sender,
                    content: envelope.content,
                }
            }
        };
        let fragment = match Fragment::from_value(&value) {
            Ok(fragment) => fragment,
            Err(_) => {
                // Routed through the reassembler so the rejection is counted.
                self.reassembler.add_value(&value);
                return Inbound::Invalid;
            }
        };
        let sender = fragment.sender().to_string();
        match self.reassembler.add_chunk(fragment) {
            Some(content) => Inbound::Message { sender, content },
            None => Inbound::Partial { sender },
        }
    }

    /// Periodic sweep: resend envelopes whose ACK is overdue, drop those out
    /// of retries, evict stale reassembly buffers and expire old queue
    /// entries.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for sequence in self.protocol.check_pending_timeouts(self.config.ack_timeout) {
            match self.protocol.mark_retry(sequence) {
                Some(envelope) => {
                    let mut send = SendReport::default();
                    match self.enqueue_envelope(&envelope, &mut send) {
                        Ok(()) if send.is_complete() => report.retried.push(sequence),
                        Ok(()) => report.failed.push(sequence),
                        Err(err) => {
                            tracing::warn!(target = "tmux_relay::messenger", sequence, error = %err, "retry encode failed");
                            report.failed.push(sequence);
                        }
                    }
                }
                None => report.failed.push(sequence),
            }
        }

        report.reassembly_timeouts = self.reassembler.check_timeouts();
        report.expired = self.queue.expire_old_messages(self.config.max_queue_age);

        self.performance.sample_memory();
        report.alerts = self.performance.check_thresholds(&self.config.performance_thresholds);
        for alert in &report.alerts {
            tracing::warn!(
                target = "tmux_relay::messenger",
                agent = %self.identity,
                kind = ?alert.kind,
                "{}",
                alert.message
            );
        }

        if !report.failed.is_empty() || !report.reassembly_timeouts.is_empty() {
            tracing::info!(
                target = "tmux_relay::messenger",
                retried = report.retried.len(),
                failed = report.failed.len(),
                reassembly_timeouts = report.reassembly_timeouts.len(),
                expired = report.expired,
                "tick"
            );
        }
        report
    }

    pub fn stats(&self) -> MessengerStats {
        MessengerStats {
            protocol: self.protocol.get_stats(),
            queue: self.queue.get_stats(),
            reassembly: self.reassembler.get_stats(),
            performance: self.performance.snapshot(),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{performance::AlertKind, terminal::fake::FakeTerminal};

    fn messenger(name: &str) -> Messenger {
        Messenger::new(
            name,
            MessengerConfig {
                chunk_size: 100,
                ..MessengerConfig::default()
            },
        )
    }

    fn drain(m: &Messenger) -> Vec<String> {
        std::iter::from_fn(|| m.queue().try_dequeue())
            .map(|q| q.content)
            .collect()
    }

    fn long_text() -> String {
        (0..60)
            .map(|i| format!("Sentence number {i} talks about the build."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn short_message_round_trip_with_ack() {
        let alice = messenger("alice");
        let bob = messenger("bob");

        let report = alice.send("hello bob", Priority::NORMAL, Metadata::new()).unwrap();
        assert_eq!(report.queued.len(), 1);

        let wires = drain(&alice);
        assert_eq!(wires.len(), 1);
        let received = bob.receive(&wires[0]);
        assert_eq!(
            received.inbound,
            Inbound::Message {
                sender: "alice".into(),
                content: "hello bob".into()
            }
        );

        let ack = received.ack.unwrap();
        assert_eq!(ack.ack_sequence, Some(report.queued[0]));
        let back = alice.receive(&encode_message(&ack).unwrap());
        assert!(matches!(back.inbound, Inbound::Control(AckOutcome::Acked(_))));
        assert!(back.ack.is_none());
        assert_eq!(alice.protocol().get_stats().pending, 0);
    }

    #[test]
    fn long_message_reassembles_out_of_order() {
        let alice = messenger("alice");
        let bob = messenger("bob");
        let text = long_text();

        let report = alice.send(&text, Priority::HIGH, Metadata::new()).unwrap();
        assert!(report.queued.len() > 3);

        let mut wires = drain(&alice);
        wires.reverse();
        let last = wires.len() - 1;
        for (i, wire) in wires.iter().enumerate() {
            let received = bob.receive(wire);
            if i == last {
                assert_eq!(
                    received.inbound,
                    Inbound::Message {
                        sender: "alice".into(),
                        content: text.clone()
                    }
                );
            } else {
                assert_eq!(received.inbound, Inbound::Partial { sender: "alice".into() });
            }
        }
    }

    #[test]
    fn duplicates_are_re_acked() {
        let alice = messenger("alice");
        let bob = messenger("bob");
        alice.send("once", Priority::NORMAL, Metadata::new()).unwrap();
        let wire = drain(&alice).remove(0);

        assert!(matches!(bob.receive(&wire).inbound, Inbound::Message { .. }));
        let again = bob.receive(&wire);
        assert!(matches!(again.inbound, Inbound::Duplicate { .. }));
        assert!(again.ack.is_some());
        assert_eq!(bob.protocol().get_stats().duplicates, 1);
    }

    #[test]
    fn garbage_counts_as_decode_failure() {
        let bob = messenger("bob");
        let received = bob.receive("definitely not an envelope");
        assert_eq!(received.inbound, Inbound::Invalid);
        assert!(received.ack.is_none());
        assert_eq!(bob.stats().decode_failures, 1);
        assert_eq!(bob.stats().performance.errors_by_kind.get("decode"), Some(&1));
    }

    #[test]
    fn malformed_fragment_is_invalid() {
        let alice = messenger("alice");
        let bob = messenger("bob");
        let envelope = alice.protocol().prepare_message(
            r#"{"type":"chunked","message_id":"m","chunk_index":5,"total_chunks":2,"sender":"alice","timestamp":"t","content":"x"}"#,
            "alice",
            MessageType::Chunked,
            Priority::NORMAL,
            Metadata::new(),
        );
        let received = bob.receive(&encode_message(&envelope).unwrap());
        assert_eq!(received.inbound, Inbound::Invalid);
        assert_eq!(bob.reassembler().get_stats().errors, 1);
    }

    #[test]
    fn plain_text_bodies_are_delivered() {
        let alice = messenger("alice");
        let bob = messenger("bob");
        let envelope = alice.protocol().prepare_message(
            "just text",
            "alice",
            MessageType::Standard,
            Priority::NORMAL,
            Metadata::new(),
        );
        let received = bob.receive(&encode_message(&envelope).unwrap());
        assert_eq!(
            received.inbound,
            Inbound::Message {
                sender: "alice".into(),
                content: "just text".into()
            }
        );
    }

    #[test]
    fn heartbeat_and_status_are_acked() {
        let alice = messenger("alice");
        let bob = messenger("bob");
        alice.send_heartbeat().unwrap();
        alice.send_status(&serde_json::json!({"state": "busy"})).unwrap();
        let wires = drain(&alice);
        assert_eq!(wires.len(), 2);

        let inbound: Vec<Inbound> = wires.iter().map(|w| bob.receive(w).inbound).collect();
        assert!(inbound.contains(&Inbound::Heartbeat { sender: "alice".into() }));
        assert!(inbound.contains(&Inbound::Status {
            sender: "alice".into(),
            status: serde_json::json!({"state": "busy"})
        }));
    }

    #[test]
    fn tick_requeues_overdue_envelopes_until_retries_run_out() {
        let alice = Messenger::new(
            "alice",
            MessengerConfig {
                ack_timeout: Duration::ZERO,
                ..MessengerConfig::default()
            },
        );
        let sequence = alice.send("ping", Priority::NORMAL, Metadata::new()).unwrap().queued[0];
        drain(&alice);

        std::thread::sleep(Duration::from_millis(5));
        let first = alice.tick();
        assert_eq!(first.retried, vec![sequence]);
        let resent = drain(&alice);
        assert_eq!(resent.len(), 1);
        assert_eq!(decode_message(&resent[0]).unwrap().retry_count, 1);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(alice.tick().retried, vec![sequence]);
        drain(&alice);

        std::thread::sleep(Duration::from_millis(5));
        let last = alice.tick();
        assert_eq!(last.failed, vec![sequence]);
        assert_eq!(alice.protocol().get_stats().failed, 1);
    }

    #[test]
    fn full_queue_rejections_are_reported_per_fragment() {
        let alice = Messenger::new(
            "alice",
            MessengerConfig {
                chunk_size: 100,
                queue: QueueConfig {
                    max_size: 1,
                    ..QueueConfig::default()
                },
                ..MessengerConfig::default()
            },
        );
        let report = alice.send(&long_text(), Priority::NORMAL, Metadata::new()).unwrap();
        assert_eq!(report.queued.len(), 1);
        assert!(!report.is_complete());
        assert!(report.rejected.iter().all(|(_, err)| *err == QueueError::Full));

        let kept = report.clone();
        assert_eq!(kept, report);
    }

    #[test]
    fn tick_raises_alert_when_error_rate_is_breached() {
        let bob = messenger("bob");
        assert!(bob.tick().alerts.is_empty());

        assert_eq!(bob.receive("garbage from the pane").inbound, Inbound::Invalid);
        let report = bob.tick();
        let kinds: Vec<AlertKind> = report.alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::ErrorRate]);
        assert!(report.alerts[0].message.contains("error rate"));
    }

    #[tokio::test]
    async fn flush_delivers_in_priority_order() {
        let terminal = Arc::new(FakeTerminal::default());
        let alice = messenger("alice");
        let to = AgentTarget::parse("team:bob").unwrap();

        alice.send("later", Priority::LOWEST, Metadata::new()).unwrap();
        alice.send("urgent", Priority::HIGHEST, Metadata::new()).unwrap();

        let report = alice.flush(terminal.as_ref(), &to, 10).await;
        assert_eq!(report, FlushReport { delivered: 2, failed: 0 });

        let sent = terminal.sent_to("team:bob");
        assert!(decode_message(&sent[0]).unwrap().content.contains("urgent"));
        assert!(decode_message(&sent[1]).unwrap().content.contains("later"));
        assert_eq!(alice.performance().snapshot().total_operations, 2);
    }

    #[tokio::test]
    async fn flush_counts_rejected_sends() {
        let terminal = FakeTerminal::default();
        *terminal.fail_send.lock() = true;
        let alice = messenger("alice");
        alice.send("x", Priority::NORMAL, Metadata::new()).unwrap();
        let report = alice
            .flush(&terminal, &AgentTarget::parse("team:bob").unwrap(), 10)
            .await;
        assert_eq!(report.failed, 1);
        assert!(alice.queue().is_empty());
    }
}
