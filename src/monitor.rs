use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::{
    detector::AgentHealthStatus,
    events::EventEmitter,
    recovery::{HealthContext, RecoveryCoordinator, RecoveryOptions, RecoveryOutcome, RestartExecutor},
    target::AgentTarget,
    terminal::TerminalAdapter,
};

#[derive(Debug, Clone)]
struct TargetState {
    latest: Option<AgentHealthStatus>,
    last_response_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
pub struct MonitorReport {
    pub statuses: Vec<AgentHealthStatus>,
    pub recoveries: BTreeMap<AgentTarget, RecoveryOutcome>,
}

/// Periodically checks every target and hands unhealthy ones to the
/// recovery coordinator.
pub struct HealthMonitor<A, R> {
    coordinator: RecoveryCoordinator<A, R>,
    targets: Vec<AgentTarget>,
    options: RecoveryOptions,
    interval: Duration,
    events: EventEmitter,
    state: Mutex<HashMap<AgentTarget, TargetState>>,
}

impl<A: TerminalAdapter, R: RestartExecutor> HealthMonitor<A, R> {
    pub fn new(
        coordinator: RecoveryCoordinator<A, R>,
        targets: Vec<AgentTarget>,
        options: RecoveryOptions,
        interval: Duration,
    ) -> Self {
        let now = Utc::now();
        let state = targets
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    TargetState {
                        latest: None,
                        last_response_at: now,
                    },
                )
            })
            .collect();
        Self {
            coordinator,
            targets,
            options,
            interval,
            events: EventEmitter::default(),
            state: Mutex::new(state),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn coordinator(&self) -> &RecoveryCoordinator<A, R> {
        &self.coordinator
    }

    /// Latest status per target, in configuration order.
    pub fn latest_statuses(&self) -> Vec<AgentHealthStatus> {
        let state = self.state.lock();
        self.targets
            .iter()
            .filter_map(|t| state.get(t).and_then(|s| s.latest.clone()))
            .collect()
    }

    fn context_for(&self, target: &AgentTarget) -> HealthContext {
        let state = self.state.lock();
        match state.get(target) {
            Some(s) => HealthContext {
                last_response_at: Some(s.last_response_at),
                consecutive_failures: s.latest.as_ref().map_or(0, |l| l.consecutive_failures),
            },
            None => HealthContext::default(),
        }
    }

    fn record(&self, status: &AgentHealthStatus) {
        let mut state = self.state.lock();
        let entry = state.entry(status.target.clone()).or_insert_with(|| TargetState {
            latest: None,
            last_response_at: status.last_check,
        });
        if status.is_healthy || !status.is_idle {
            entry.last_response_at = status.last_check;
        }
        entry.latest = Some(status.clone());
    }

    /// Run one health check per target without attempting recovery.
    pub async fn check_all(&self) -> Vec<AgentHealthStatus> {
        let detector = self.coordinator.detector();
        let statuses: Vec<AgentHealthStatus> = stream::iter(self.targets.iter().map(|target| {
            let context = self.context_for(target);
            async move {
                detector
                    .check_agent_health(
                        target,
                        context.last_response_at.unwrap_or_else(Utc::now),
                        context.consecutive_failures,
                        &self.options.thresholds,
                    )
                    .await
            }
        }))
        .buffered(self.options.parallel_limit.max(1))
        .collect()
        .await;

        for status in &statuses {
            self.record(status);
            self.events.emit("health_status", status);
        }
        statuses
    }

    /// One monitoring round: check everything, then recover the unhealthy
    /// targets that are not already being recovered.
    pub async fn tick(&self) -> MonitorReport {
        let statuses = self.check_all().await;

        let requests: Vec<(AgentTarget, HealthContext)> = statuses
            .iter()
            .filter(|s| !s.is_healthy && !self.coordinator.is_recovering(&s.target))
            .map(|s| (s.target.clone(), self.context_for(&s.target)))
            .collect();

        let recoveries = if requests.is_empty() {
            BTreeMap::new()
        } else {
            tracing::info!(
                target = "tmux_relay::monitor",
                unhealthy = requests.len(),
                "dispatching recovery"
            );
            self.coordinator.recover_many(requests, &self.options).await
        };

        for (target, outcome) in &recoveries {
            if outcome.session.recovery_successful {
                if let Some(status) = outcome.session.health_checks.last() {
                    self.record(status);
                }
            }
            tracing::debug!(target = "tmux_relay::monitor", agent = %target, status = %outcome.session.status, "recovery result");
        }

        MonitorReport { statuses, recoveries }
    }

    /// Tick every `interval` until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            target = "tmux_relay::monitor",
            targets = self.targets.len(),
            interval_secs = self.interval.as_secs(),
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(target = "tmux_relay::monitor", "health monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    let unhealthy = report.statuses.iter().filter(|s| !s.is_healthy).count();
                    tracing::debug!(
                        target = "tmux_relay::monitor",
                        checked = report.statuses.len(),
                        unhealthy,
                        recovered = report.recoveries.values().filter(|o| o.success).count(),
                        "monitor tick"
                    );
                }
            }
        }
    }
}
