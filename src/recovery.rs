//! Coordinated recovery of unhealthy agents.
//!
//! One invocation walks `health check -> notify -> restart -> verify`,
//! enforcing a soft wall-clock budget that is checked before each stage.
//! Only a malformed target is returned as an error; every other failure is
//! recorded in the [`RecoverySession`] and reflected in the outcome.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::AuditLog,
    detector::{AgentHealthStatus, FailureDetector, FailureThresholds},
    error::RelayError,
    events::EventEmitter,
    notify::{NotificationKind, RecoveryNotifier},
    target::AgentTarget,
    terminal::TerminalAdapter,
    types::Metadata,
};

/// Seconds of remaining budget granted per restart attempt.
const SECONDS_PER_ATTEMPT: u64 = 15;
const MAX_RESTART_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartOutcome {
    pub success: bool,
    pub message: String,
}

impl RestartOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Relaunches an agent. `Err` means the restart could not be carried out at
/// all; an orderly failure is `Ok` with `success == false`.
pub trait RestartExecutor: Send + Sync {
    fn restart_agent(
        &self,
        target: &AgentTarget,
        briefing: Option<&str>,
    ) -> impl Future<Output = anyhow::Result<RestartOutcome>> + Send;
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub thresholds: FailureThresholds,
    pub recovery_timeout: Duration,
    /// Upper bound for a single restart attempt.
    pub restart_attempt_timeout: Duration,
    pub enable_auto_restart: bool,
    pub briefing: Option<String>,
    pub parallel_limit: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            thresholds: FailureThresholds::default(),
            recovery_timeout: Duration::from_secs(60),
            restart_attempt_timeout: Duration::from_secs(30),
            enable_auto_restart: true,
            briefing: None,
            parallel_limit: 3,
        }
    }
}

/// What the caller knows about a target before recovery starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthContext {
    /// Defaults to now.
    pub last_response_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    HealthCheck,
    HealthyExit,
    NotifyStart,
    Restart,
    Verify,
    Success,
    Failed,
    TimeoutExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Healthy,
    Recovered,
    TimeoutReached,
    AutoRestartDisabled,
    RecoveryAlreadyInProgress,
    RestartFailed,
    VerificationFailed,
}

impl RecoveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Healthy => "healthy",
            Self::Recovered => "recovered",
            Self::TimeoutReached => "timeout_reached",
            Self::AutoRestartDisabled => "auto_restart_disabled",
            Self::RecoveryAlreadyInProgress => "recovery_already_in_progress",
            Self::RestartFailed => "restart_failed",
            Self::VerificationFailed => "verification_failed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Healthy | Self::Recovered)
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub at: DateTime<Utc>,
    pub stage: RecoveryStage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub data: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub target: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub health_checks: Vec<AgentHealthStatus>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub restart_attempts: u32,
    pub total_duration_ms: u64,
    pub status: RecoveryStatus,
    pub events: Vec<RecoveryEvent>,
}

impl RecoverySession {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            session_id: new_session_id(),
            started_at: Utc::now(),
            health_checks: Vec::new(),
            recovery_attempted: false,
            recovery_successful: false,
            restart_attempts: 0,
            total_duration_ms: 0,
            status: RecoveryStatus::Pending,
            events: Vec::new(),
        }
    }

    fn log(&mut self, stage: RecoveryStage, message: impl Into<String>) {
        self.log_with(stage, message, Metadata::new());
    }

    fn log_with(&mut self, stage: RecoveryStage, message: impl Into<String>, data: Metadata) {
        let message = message.into();
        tracing::debug!(
            target = "tmux_relay::recovery",
            agent = %self.target,
            session_id = %self.session_id,
            ?stage,
            "{message}"
        );
        self.events.push(RecoveryEvent {
            at: Utc::now(),
            stage,
            message,
            data,
        });
    }
}

fn new_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub message: String,
    pub session: RecoverySession,
}

/// Restart attempts allowed with `remaining` budget left: one per 15s,
/// at most 3. Under 15s this is 0 and recovery ends as `timeout_reached`.
pub fn retry_budget(remaining: Duration) -> u32 {
    let by_time = u32::try_from(remaining.as_secs() / SECONDS_PER_ATTEMPT).unwrap_or(u32::MAX);
    by_time.min(MAX_RESTART_ATTEMPTS)
}

/// Removes its target from the in-flight set on drop.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<AgentTarget>>,
    target: AgentTarget,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<AgentTarget>>, target: &AgentTarget) -> Option<Self> {
        in_flight.lock().insert(target.clone()).then(|| Self {
            in_flight,
            target: target.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.target);
    }
}

pub struct RecoveryCoordinator<A, R> {
    detector: FailureDetector<A>,
    restarter: Arc<R>,
    notifier: RecoveryNotifier<A>,
    audit: Option<AuditLog>,
    events: EventEmitter,
    in_flight: Mutex<HashSet<AgentTarget>>,
}

impl<A, R> fmt::Debug for RecoveryCoordinator<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl<A: TerminalAdapter, R: RestartExecutor> RecoveryCoordinator<A, R> {
    pub fn new(detector: FailureDetector<A>, restarter: Arc<R>, notifier: RecoveryNotifier<A>) -> Self {
        Self {
            detector,
            restarter,
            notifier,
            audit: None,
            events: EventEmitter::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn detector(&self) -> &FailureDetector<A> {
        &self.detector
    }

    pub fn is_recovering(&self, target: &AgentTarget) -> bool {
        self.in_flight.lock().contains(target)
    }

    /// Recover a target given as `session:window`. Fails only when the
    /// target string is malformed.
    pub async fn coordinate_agent_recovery(
        &self,
        target: &str,
        options: &RecoveryOptions,
    ) -> Result<RecoveryOutcome, RelayError> {
        let target = AgentTarget::parse(target)?;
        Ok(self.recover(&target, options, HealthContext::default()).await)
    }

    /// Recover several targets with at most `options.parallel_limit` in
    /// flight. One target's failure never affects the others. Repeated
    /// targets are recovered once.
    pub async fn batch_recovery_coordination<S: AsRef<str>>(
        &self,
        targets: &[S],
        options: &RecoveryOptions,
    ) -> BTreeMap<String, Result<RecoveryOutcome, RelayError>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = targets
            .iter()
            .map(|raw| raw.as_ref().trim().to_string())
            .filter(|raw| seen.insert(raw.clone()))
            .collect();

        stream::iter(unique.into_iter().map(|raw| {
            async move {
                let result = self.coordinate_agent_recovery(&raw, options).await;
                (raw, result)
            }
        }))
        .buffer_unordered(options.parallel_limit.max(1))
        .collect()
        .await
    }

    /// Batch variant for callers that already hold parsed targets and
    /// their health history.
    pub async fn recover_many(
        &self,
        requests: Vec<(AgentTarget, HealthContext)>,
        options: &RecoveryOptions,
    ) -> BTreeMap<AgentTarget, RecoveryOutcome> {
        stream::iter(requests.into_iter().map(|(target, context)| async move {
            let outcome = self.recover(&target, options, context).await;
            (target, outcome)
        }))
        .buffer_unordered(options.parallel_limit.max(1))
        .collect()
        .await
    }

    pub async fn recover(
        &self,
        target: &AgentTarget,
        options: &RecoveryOptions,
        context: HealthContext,
    ) -> RecoveryOutcome {
        let started = Instant::now();
        let mut session = RecoverySession::new(&target.to_string());

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, target) else {
            session.log(RecoveryStage::Failed, "another recovery for this target is running");
            return self.finish(
                session,
                started,
                RecoveryStatus::RecoveryAlreadyInProgress,
                format!("recovery_already_in_progress: {target} is already being recovered"),
            );
        };

        session.log(RecoveryStage::HealthCheck, "checking agent health");
        let status = self
            .detector
            .check_agent_health(
                target,
                context.last_response_at.unwrap_or_else(Utc::now),
                context.consecutive_failures,
                &options.thresholds,
            )
            .await;
        let reason = status.failure_reason.to_string();
        session.health_checks.push(status.clone());

        if status.is_healthy {
            session.log(RecoveryStage::HealthyExit, "agent is healthy");
            return self.finish(
                session,
                started,
                RecoveryStatus::Healthy,
                format!("agent {target} is healthy, no recovery needed"),
            );
        }

        if started.elapsed() >= options.recovery_timeout {
            session.log(RecoveryStage::TimeoutExit, "budget spent before restart");
            return self.finish(
                session,
                started,
                RecoveryStatus::TimeoutReached,
                format!("timeout_reached: {target} unhealthy ({reason}) and recovery budget exhausted"),
            );
        }

        if !options.enable_auto_restart {
            let detail = format!("{reason}; auto restart disabled");
            let notified = self.notifier.notify(target, NotificationKind::RecoveryFailed, &detail).await;
            session.log_with(
                RecoveryStage::Failed,
                "auto restart disabled",
                notification_data(notified.sent, &notified.reason),
            );
            return self.finish(
                session,
                started,
                RecoveryStatus::AutoRestartDisabled,
                format!("auto_restart_disabled: {target} unhealthy ({reason})"),
            );
        }

        let notified = self.notifier.notify(target, NotificationKind::RecoveryStarted, &reason).await;
        session.log_with(
            RecoveryStage::NotifyStart,
            "recovery started",
            notification_data(notified.sent, &notified.reason),
        );
        self.events.emit(
            "recovery_started",
            json!({ "target": target, "session_id": session.session_id, "reason": reason }),
        );

        let remaining = options.recovery_timeout.saturating_sub(started.elapsed());
        let budget = retry_budget(remaining);
        session.recovery_attempted = budget > 0;
        let mut restarted = false;
        let mut last_error = String::from("no restart attempted");
        if budget == 0 {
            last_error = format!(
                "{}s left is under the {SECONDS_PER_ATTEMPT}s needed for a restart attempt",
                remaining.as_secs()
            );
            session.log(RecoveryStage::TimeoutExit, last_error.clone());
        }
        for attempt in 1..=budget {
            if attempt > 1 && started.elapsed() >= options.recovery_timeout {
                session.log(RecoveryStage::TimeoutExit, "budget spent between restart attempts");
                break;
            }
            session.restart_attempts = attempt;
            session.log(RecoveryStage::Restart, format!("restart attempt {attempt}/{budget}"));

            let result = tokio::time::timeout(
                options.restart_attempt_timeout,
                self.restarter.restart_agent(target, options.briefing.as_deref()),
            )
            .await;
            match result {
                Ok(Ok(outcome)) if outcome.success => {
                    session.log(RecoveryStage::Restart, outcome.message);
                    restarted = true;
                    break;
                }
                Ok(Ok(outcome)) => last_error = outcome.message,
                Ok(Err(err)) => last_error = format!("restart error: {err:#}"),
                Err(_) => {
                    last_error = format!(
                        "restart attempt timed out after {}s",
                        options.restart_attempt_timeout.as_secs()
                    )
                }
            }
            session.log(RecoveryStage::Restart, format!("attempt {attempt} failed: {last_error}"));
        }

        if !restarted {
            let status = if budget == 0 || started.elapsed() >= options.recovery_timeout {
                RecoveryStatus::TimeoutReached
            } else {
                RecoveryStatus::RestartFailed
            };
            self.notifier.notify(target, NotificationKind::RecoveryFailed, &last_error).await;
            session.log(RecoveryStage::Failed, last_error.clone());
            return self.finish(
                session,
                started,
                status,
                format!("{status}: could not restart {target}: {last_error}"),
            );
        }

        if started.elapsed() >= options.recovery_timeout {
            session.log(RecoveryStage::Verify, "verification skipped, budget spent");
        } else {
            session.log(RecoveryStage::Verify, "verifying restarted agent");
            let verification = self
                .detector
                .check_agent_health(target, Utc::now(), 0, &options.thresholds)
                .await;
            let healthy = verification.is_healthy;
            let verify_reason = verification.failure_reason.to_string();
            session.health_checks.push(verification);
            if !healthy {
                self.notifier
                    .notify(target, NotificationKind::RecoveryFailed, &verify_reason)
                    .await;
                session.log(RecoveryStage::Failed, format!("verification failed: {verify_reason}"));
                return self.finish(
                    session,
                    started,
                    RecoveryStatus::VerificationFailed,
                    format!("verification_failed: {target} restarted but is still unhealthy ({verify_reason})"),
                );
            }
        }

        self.notifier
            .notify(target, NotificationKind::RecoverySuccess, &reason)
            .await;
        session.log(RecoveryStage::Success, "agent recovered");
        self.finish(
            session,
            started,
            RecoveryStatus::Recovered,
            format!("agent {target} recovered after {reason}"),
        )
    }

    fn finish(
        &self,
        mut session: RecoverySession,
        started: Instant,
        status: RecoveryStatus,
        message: String,
    ) -> RecoveryOutcome {
        session.status = status;
        session.recovery_successful = session.recovery_attempted && status.is_success();
        session.total_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if status == RecoveryStatus::Healthy || status == RecoveryStatus::Recovered {
            tracing::info!(target = "tmux_relay::recovery", agent = %session.target, %status, duration_ms = session.total_duration_ms, "{message}");
        } else {
            tracing::warn!(target = "tmux_relay::recovery", agent = %session.target, %status, duration_ms = session.total_duration_ms, "{message}");
        }

        if let Some(audit) = &self.audit {
            if let Err(err) = audit.append(&session) {
                tracing::warn!(target = "tmux_relay::recovery", error = %err, "failed to write audit entry");
            }
        }
        self.events.emit(
            "recovery_finished",
            json!({
                "target": session.target,
                "session_id": session.session_id,
                "status": status,
                "success": status.is_success(),
                "duration_ms": session.total_duration_ms,
            }),
        );

        RecoveryOutcome {
            success: status.is_success(),
            message,
            session,
        }
    }
}

fn notification_data(sent: bool, reason: &str) -> Metadata {
    let mut data = Metadata::new();
    data.insert("notification_sent".into(), sent.into());
    data.insert("notification_reason".into(), reason.into());
    data
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        detector::IdleSampling,
        notify::NotificationManager,
        terminal::fake::FakeTerminal,
    };

    const PROMPT: &str = "╭─────╮\n│ >   │\n? for shortcuts";

    /// Restarter that fails a fixed number of times, then repaints the pane
    /// with `after_restart`.
    struct ScriptedRestarter {
        terminal: Arc<FakeTerminal>,
        failures_left: AtomicU32,
        calls: AtomicU32,
        after_restart: String,
        error: bool,
    }

    impl ScriptedRestarter {
        fn new(terminal: &Arc<FakeTerminal>, failures: u32, after_restart: &str) -> Self {
            Self {
                terminal: Arc::clone(terminal),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                after_restart: after_restart.to_string(),
                error: false,
            }
        }
    }

    impl RestartExecutor for ScriptedRestarter {
        async fn restart_agent(&self, target: &AgentTarget, _briefing: Option<&str>) -> anyhow::Result<RestartOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.error {
                anyhow::bail!("tmux vanished");
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(RestartOutcome::failed("pane busy"));
            }
            self.terminal.set_screen(&target.to_string(), &self.after_restart);
            Ok(RestartOutcome::succeeded("relaunched"))
        }
    }

    fn coordinator(
        terminal: &Arc<FakeTerminal>,
        restarter: ScriptedRestarter,
    ) -> RecoveryCoordinator<FakeTerminal, ScriptedRestarter> {
        let detector = FailureDetector::new(
            Arc::clone(terminal),
            IdleSampling {
                interval: Duration::ZERO,
                ..IdleSampling::default()
            },
        );
        let notifier = RecoveryNotifier::new(
            Arc::clone(terminal),
            Some(AgentTarget::parse("ops:boss").unwrap()),
            NotificationManager::in_memory(),
            Duration::from_secs(300),
        );
        RecoveryCoordinator::new(detector, Arc::new(restarter), notifier)
    }

    #[test]
    fn retry_budget_scales_with_time() {
        assert_eq!(retry_budget(Duration::from_secs(60)), 3);
        assert_eq!(retry_budget(Duration::from_secs(30)), 2);
        assert_eq!(retry_budget(Duration::from_secs(16)), 1);
        assert_eq!(retry_budget(Duration::from_secs(15)), 1);
        assert_eq!(retry_budget(Duration::from_secs(14)), 0);
        assert_eq!(retry_budget(Duration::from_secs(5)), 0);
        assert_eq!(retry_budget(Duration::from_secs(3600)), 3);
    }

    #[test]
    fn session_ids_are_short_tokens() {
        let a = new_session_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, new_session_id());
    }

    #[tokio::test]
    async fn malformed_target_is_rejected_before_side_effects() {
        let terminal = Arc::new(FakeTerminal::default());
        let restarter = ScriptedRestarter::new(&terminal, 0, PROMPT);
        let coord = coordinator(&terminal, restarter);
        let err = coord
            .coordinate_agent_recovery("no-window", &RecoveryOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(terminal.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn healthy_agent_skips_recovery() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", PROMPT));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT));
        let outcome = coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("healthy"));
        assert!(!outcome.session.recovery_attempted);
        assert_eq!(outcome.session.status, RecoveryStatus::Healthy);
        assert_eq!(outcome.session.health_checks.len(), 1);
        assert!(terminal.sent_to("ops:boss").is_empty());
    }

    #[tokio::test]
    async fn crashed_agent_is_restarted_and_verified() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "Segmentation fault (core dumped)"));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 1, PROMPT));
        let outcome = coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.success, "{}", outcome.message);
        let session = &outcome.session;
        assert!(session.recovery_attempted);
        assert!(session.recovery_successful);
        assert_eq!(session.restart_attempts, 2);
        assert_eq!(session.status, RecoveryStatus::Recovered);
        assert_eq!(session.health_checks.len(), 2);
        assert!(session.health_checks[1].is_healthy);

        let sent = terminal.sent_to("ops:boss");
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("recovery started"));
        assert!(sent[1].contains("recovery succeeded"));

        let stages: Vec<RecoveryStage> = session.events.iter().map(|e| e.stage).collect();
        assert_eq!(stages.first(), Some(&RecoveryStage::HealthCheck));
        assert!(stages.contains(&RecoveryStage::NotifyStart));
        assert!(stages.contains(&RecoveryStage::Verify));
        assert_eq!(stages.last(), Some(&RecoveryStage::Success));
    }

    #[tokio::test]
    async fn started_event_is_only_emitted_once_recovery_begins() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", PROMPT));
        terminal.set_screen("team:dev", "crashed");
        let (events, captured) = EventEmitter::capturing();
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT)).with_events(events);

        coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();
        let types: Vec<String> = captured.lock().iter().map(|e| e["type"].as_str().unwrap().to_string()).collect();
        assert_eq!(types, ["recovery_finished"]);

        captured.lock().clear();
        coord
            .coordinate_agent_recovery("team:dev", &RecoveryOptions::default())
            .await
            .unwrap();
        let lines = captured.lock();
        let types: Vec<&str> = lines.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["recovery_started", "recovery_finished"]);
        assert_eq!(lines[0]["payload"]["target"], "team:dev");
    }

    #[tokio::test]
    async fn failed_verification_fails_recovery() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "connection lost"));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, "fatal error: still broken"));
        let outcome = coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.session.status, RecoveryStatus::VerificationFailed);
        assert!(!outcome.session.recovery_successful);
        assert!(terminal.sent_to("ops:boss").last().unwrap().contains("FAILED"));
    }

    #[tokio::test]
    async fn exhausted_restarts_report_failure() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "crashed"));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 10, PROMPT));
        let outcome = coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.session.status, RecoveryStatus::RestartFailed);
        assert_eq!(outcome.session.restart_attempts, 3);
        assert!(outcome.message.contains("pane busy"));
    }

    #[tokio::test]
    async fn restart_errors_are_captured() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "crashed"));
        let mut restarter = ScriptedRestarter::new(&terminal, 0, PROMPT);
        restarter.error = true;
        let coord = coordinator(&terminal, restarter);
        let options = RecoveryOptions {
            recovery_timeout: Duration::from_secs(20),
            ..RecoveryOptions::default()
        };
        let outcome = coord.coordinate_agent_recovery("team:lead", &options).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.session.restart_attempts, 1);
        assert!(outcome.message.contains("tmux vanished"));
    }

    #[tokio::test]
    async fn auto_restart_disabled_only_notifies() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "crashed"));
        let restarter = ScriptedRestarter::new(&terminal, 0, PROMPT);
        let coord = coordinator(&terminal, restarter);
        let options = RecoveryOptions {
            enable_auto_restart: false,
            ..RecoveryOptions::default()
        };
        let outcome = coord.coordinate_agent_recovery("team:lead", &options).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("auto_restart_disabled"));
        assert!(!outcome.session.recovery_attempted);
        assert_eq!(coord.restarter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(terminal.sent_to("ops:boss").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_exits_before_restart() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "crashed"));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT));
        let options = RecoveryOptions {
            recovery_timeout: Duration::ZERO,
            ..RecoveryOptions::default()
        };
        let outcome = coord.coordinate_agent_recovery("team:lead", &options).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("timeout_reached"));
        assert!(!outcome.session.recovery_attempted);
        assert_eq!(coord.restarter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_under_one_attempt_reports_timeout_without_restarting() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", "crashed"));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT));
        let options = RecoveryOptions {
            recovery_timeout: Duration::from_secs(10),
            ..RecoveryOptions::default()
        };
        let outcome = coord.coordinate_agent_recovery("team:lead", &options).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.session.status, RecoveryStatus::TimeoutReached);
        assert!(outcome.message.starts_with("timeout_reached"), "{}", outcome.message);
        assert!(!outcome.session.recovery_attempted);
        assert_eq!(outcome.session.restart_attempts, 0);
        assert_eq!(coord.restarter.calls.load(Ordering::SeqCst), 0);

        let sent = terminal.sent_to("ops:boss");
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("recovery started"));
        assert!(sent[1].contains("FAILED"));
    }

    #[tokio::test]
    async fn concurrent_recovery_of_same_target_is_refused() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", PROMPT));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT));
        let target = AgentTarget::parse("team:lead").unwrap();

        let held = InFlightGuard::acquire(&coord.in_flight, &target).unwrap();
        assert!(coord.is_recovering(&target));
        let outcome = coord
            .recover(&target, &RecoveryOptions::default(), HealthContext::default())
            .await;
        assert_eq!(outcome.session.status, RecoveryStatus::RecoveryAlreadyInProgress);
        assert!(!outcome.success);

        drop(held);
        assert!(!coord.is_recovering(&target));
        let outcome = coord
            .recover(&target, &RecoveryOptions::default(), HealthContext::default())
            .await;
        assert!(outcome.success);
        assert!(!coord.is_recovering(&target));
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let terminal = Arc::new(FakeTerminal::with_screen("team:a", PROMPT));
        terminal.set_screen("team:b", "crashed");
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT));

        let results = coord
            .batch_recovery_coordination(&["team:a", "team:b", "bogus"], &RecoveryOptions::default())
            .await;
        assert_eq!(results.len(), 3);
        assert!(results["team:a"].as_ref().unwrap().success);
        assert_eq!(
            results["team:b"].as_ref().unwrap().session.status,
            RecoveryStatus::Recovered
        );
        assert!(results["bogus"].is_err());
    }

    #[tokio::test]
    async fn sessions_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = Arc::new(FakeTerminal::with_screen("team:lead", PROMPT));
        let coord = coordinator(&terminal, ScriptedRestarter::new(&terminal, 0, PROMPT))
            .with_audit_log(AuditLog::new(dir.path().join("recovery.jsonl")));
        coord
            .coordinate_agent_recovery("team:lead", &RecoveryOptions::default())
            .await
            .unwrap();

        let audit = coord.audit.as_ref().unwrap().read_recent(5).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].target, "team:lead");
        assert_eq!(audit[0].status, RecoveryStatus::Healthy);
    }
}
