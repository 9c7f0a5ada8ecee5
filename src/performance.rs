//! Rolling-window telemetry for the messaging pipeline.
//!
//! Tracks operation latency, throughput, error counts by kind and the
//! process memory footprint. Snapshots serialize with serde, can be
//! checked against [`PerformanceThresholds`] and exported as Prometheus text.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;

/// Latency samples kept for percentile calculation.
const DEFAULT_WINDOW_SIZE: usize = 500;
/// Span over which throughput is averaged.
const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(60);
/// Page size assumed when converting `/proc/self/statm` pages to bytes.
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct PerformanceThresholds {
    pub max_avg_latency: Duration,
    pub max_p95_latency: Duration,
    /// Fraction of operations in the window that may fail (0.0..=1.0).
    pub max_error_rate: f64,
    pub max_memory_bytes: u64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_avg_latency: Duration::from_secs(2),
            max_p95_latency: Duration::from_secs(5),
            max_error_rate: 0.1,
            max_memory_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AverageLatency,
    P95Latency,
    ErrorRate,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub uptime_secs: u64,
    pub total_operations: u64,
    pub total_errors: u64,
    /// Operations and errors inside the rolling window.
    pub window_operations: usize,
    pub window_errors: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub max_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub memory_bytes: Option<u64>,
    pub errors_by_kind: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
}

#[derive(Debug, Default)]
struct PerfState {
    samples: VecDeque<Sample>,
    error_times: VecDeque<Instant>,
    errors_by_kind: BTreeMap<String, u64>,
    total_operations: u64,
    total_errors: u64,
    memory_bytes: Option<u64>,
}

impl PerfState {
    fn prune(&mut self, window_size: usize, cutoff: Option<Instant>) {
        while self.samples.len() > window_size {
            self.samples.pop_front();
        }
        if let Some(cutoff) = cutoff {
            while self.samples.front().is_some_and(|s| s.at < cutoff) {
                self.samples.pop_front();
            }
            while self.error_times.front().is_some_and(|t| *t < cutoff) {
                self.error_times.pop_front();
            }
        }
    }
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    started: Instant,
    window_size: usize,
    window_duration: Duration,
    state: Mutex<PerfState>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_DURATION)
    }
}

impl PerformanceMonitor {
    pub fn new(window_size: usize, window_duration: Duration) -> Self {
        Self::starting_at(Instant::now(), window_size, window_duration)
    }

    pub fn starting_at(started: Instant, window_size: usize, window_duration: Duration) -> Self {
        Self {
            started,
            window_size: window_size.max(1),
            window_duration,
            state: Mutex::new(PerfState::default()),
        }
    }

    /// Record one completed operation and how long it took.
    pub fn record_latency(&self, latency: Duration) {
        self.record_latency_at(latency, Instant::now());
    }

    pub fn record_latency_at(&self, latency: Duration, now: Instant) {
        let mut state = self.state.lock();
        state.total_operations += 1;
        state.samples.push_back(Sample { at: now, latency });
        state.prune(self.window_size, now.checked_sub(self.window_duration));
    }

    pub fn record_error(&self, kind: &str) {
        self.record_error_at(kind, Instant::now());
    }

    pub fn record_error_at(&self, kind: &str, now: Instant) {
        let mut state = self.state.lock();
        state.total_errors += 1;
        state.error_times.push_back(now);
        *state.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        state.prune(self.window_size, now.checked_sub(self.window_duration));
    }

    pub fn record_memory(&self, bytes: u64) {
        self.state.lock().memory_bytes = Some(bytes);
    }

    /// Read resident memory from `/proc/self/statm` and record it.
    /// Returns `None` where procfs is unavailable.
    pub fn sample_memory(&self) -> Option<u64> {
        let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = raw.split_whitespace().nth(1)?.parse().ok()?;
        let bytes = resident_pages * PAGE_SIZE;
        self.record_memory(bytes);
        Some(bytes)
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> PerformanceSnapshot {
        let mut state = self.state.lock();
        state.prune(self.window_size, now.checked_sub(self.window_duration));

        let mut latencies: Vec<f64> = state
            .samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1000.0)
            .collect();
        latencies.sort_by(f64::total_cmp);

        let window_operations = latencies.len();
        let window_errors = state.error_times.len();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let p95_latency_ms = percentile(&latencies, 0.95);
        let max_latency_ms = latencies.last().copied().unwrap_or(0.0);

        let attempts = window_operations + window_errors;
        let error_rate = if attempts == 0 {
            0.0
        } else {
            window_errors as f64 / attempts as f64
        };

        let uptime = now.saturating_duration_since(self.started);
        let span = uptime.min(self.window_duration).as_secs_f64().max(1.0);

        PerformanceSnapshot {
            uptime_secs: uptime.as_secs(),
            total_operations: state.total_operations,
            total_errors: state.total_errors,
            window_operations,
            window_errors,
            error_rate,
            avg_latency_ms,
            p95_latency_ms,
            max_latency_ms,
            throughput_per_sec: window_operations as f64 / span,
            memory_bytes: state.memory_bytes,
            errors_by_kind: state.errors_by_kind.clone(),
        }
    }

    pub fn check_thresholds(&self, thresholds: &PerformanceThresholds) -> Vec<PerformanceAlert> {
        evaluate(&self.snapshot(), thresholds)
    }

    /// Export the current snapshot in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {value}\n"));
        };
        metric(
            "tmux_relay_uptime_seconds",
            "gauge",
            "Monitor uptime in seconds.",
            snap.uptime_secs.to_string(),
        );
        metric(
            "tmux_relay_operations_total",
            "counter",
            "Operations recorded.",
            snap.total_operations.to_string(),
        );
        metric(
            "tmux_relay_errors_total",
            "counter",
            "Errors recorded.",
            snap.total_errors.to_string(),
        );
        metric(
            "tmux_relay_latency_avg_ms",
            "gauge",
            "Average latency over the window.",
            format!("{:.3}", snap.avg_latency_ms),
        );
        metric(
            "tmux_relay_latency_p95_ms",
            "gauge",
            "95th percentile latency over the window.",
            format!("{:.3}", snap.p95_latency_ms),
        );
        metric(
            "tmux_relay_throughput_per_second",
            "gauge",
            "Operations per second over the window.",
            format!("{:.3}", snap.throughput_per_sec),
        );
        if let Some(bytes) = snap.memory_bytes {
            metric(
                "tmux_relay_memory_bytes",
                "gauge",
                "Resident memory of the process.",
                bytes.to_string(),
            );
        }

        for (kind, count) in &snap.errors_by_kind {
            out.push_str(&format!(
                "tmux_relay_errors_by_kind_total{{kind=\"{}\"}} {}\n",
                kind, count
            ));
        }

        out
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn evaluate(snap: &PerformanceSnapshot, thresholds: &PerformanceThresholds) -> Vec<PerformanceAlert> {
    let mut alerts = Vec::new();
    let max_avg_ms = thresholds.max_avg_latency.as_secs_f64() * 1000.0;
    if snap.avg_latency_ms > max_avg_ms {
        alerts.push(PerformanceAlert {
            kind: AlertKind::AverageLatency,
            message: format!(
                "average latency {:.1}ms exceeds {:.1}ms",
                snap.avg_latency_ms, max_avg_ms
            ),
        });
    }
    let max_p95_ms = thresholds.max_p95_latency.as_secs_f64() * 1000.0;
    if snap.p95_latency_ms > max_p95_ms {
        alerts.push(PerformanceAlert {
            kind: AlertKind::P95Latency,
            message: format!(
                "p95 latency {:.1}ms exceeds {:.1}ms",
                snap.p95_latency_ms, max_p95_ms
            ),
        });
    }
    if snap.error_rate > thresholds.max_error_rate {
        alerts.push(PerformanceAlert {
            kind: AlertKind::ErrorRate,
            message: format!(
                "error rate {:.1}% exceeds {:.1}%",
                snap.error_rate * 100.0,
                thresholds.max_error_rate * 100.0
            ),
        });
    }
    if let Some(bytes) = snap.memory_bytes.filter(|b| *b > thresholds.max_memory_bytes) {
        alerts.push(PerformanceAlert {
            kind: AlertKind::Memory,
            message: format!(
                "memory {} bytes exceeds {} bytes",
                bytes, thresholds.max_memory_bytes
            ),
        });
    }
    for alert in &alerts {
        tracing::warn!(target = "tmux_relay::performance", kind = ?alert.kind, "{}", alert.message);
    }
    alerts
}
