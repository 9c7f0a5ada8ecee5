use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{target::AgentTarget, terminal::TerminalAdapter};

/// Output fragments that mean the agent process is broken. Matched
/// case-insensitively.
pub const CRITICAL_ERROR_PATTERNS: &[&str] = &[
    "connection lost",
    "connection refused",
    "timeout",
    "timed out",
    "crashed",
    "segmentation fault",
    "fatal error",
    "permission denied",
    "modulenotfounderror",
    "importerror",
    "cannot find module",
    "authentication failed",
    "invalid api key",
    "command not found",
];

/// Fragments shown by a responsive assistant interface.
pub const NORMAL_INTERFACE_MARKERS: &[&str] = &[
    "? for shortcuts",
    "esc to interrupt",
    "Welcome to Claude",
    "Human:",
    "Assistant:",
    "╭─",
    "│ >",
];

/// Debounced idle sampling: idle iff `samples` captures of the last output
/// line taken `interval` apart are identical.
#[derive(Debug, Clone)]
pub struct IdleSampling {
    pub samples: usize,
    pub interval: Duration,
    /// Pane lines captured per sample; the last capture is also scanned
    /// for error patterns and interface markers.
    pub capture_lines: usize,
}

impl Default for IdleSampling {
    fn default() -> Self {
        Self {
            samples: 4,
            interval: Duration::from_millis(300),
            capture_lines: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureThresholds {
    pub max_failures: u32,
    pub response_timeout: Duration,
}

impl Default for FailureThresholds {
    fn default() -> Self {
        Self {
            max_failures: 3,
            response_timeout: Duration::from_secs(60),
        }
    }
}

impl FailureThresholds {
    /// Silence longer than this is treated as a failure.
    pub fn unresponsive_after(&self) -> Duration {
        self.response_timeout * 3
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureReason {
    Healthy,
    CriticalErrorDetected,
    MaxConsecutiveFailuresReached,
    ExtendedUnresponsiveness,
    AbnormalInterfaceState,
    HealthCheckFailed(String),
}

const HEALTH_CHECK_FAILED_PREFIX: &str = "health_check_failed: ";

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::CriticalErrorDetected => f.write_str("critical_error_detected"),
            Self::MaxConsecutiveFailuresReached => f.write_str("max_consecutive_failures_reached"),
            Self::ExtendedUnresponsiveness => f.write_str("extended_unresponsiveness"),
            Self::AbnormalInterfaceState => f.write_str("abnormal_interface_state"),
            Self::HealthCheckFailed(detail) => write!(f, "{HEALTH_CHECK_FAILED_PREFIX}{detail}"),
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.to_string()
    }
}

impl From<String> for FailureReason {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "healthy" => Self::Healthy,
            "critical_error_detected" => Self::CriticalErrorDetected,
            "max_consecutive_failures_reached" => Self::MaxConsecutiveFailuresReached,
            "extended_unresponsiveness" => Self::ExtendedUnresponsiveness,
            "abnormal_interface_state" => Self::AbnormalInterfaceState,
            other => Self::HealthCheckFailed(
                other
                    .strip_prefix(HEALTH_CHECK_FAILED_PREFIX)
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub is_failed: bool,
    pub reason: FailureReason,
    pub is_idle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthStatus {
    pub target: AgentTarget,
    pub is_healthy: bool,
    pub is_idle: bool,
    pub failure_reason: FailureReason,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
}

pub fn has_critical_errors(content: &str) -> bool {
    let lowered = content.to_lowercase();
    CRITICAL_ERROR_PATTERNS.iter().any(|p| lowered.contains(p))
}

pub fn has_normal_interface(content: &str) -> bool {
    NORMAL_INTERFACE_MARKERS.iter().any(|m| content.contains(m))
}

fn last_line(screen: &str) -> &str {
    screen
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct FailureDetector<A> {
    terminal: Arc<A>,
    sampling: IdleSampling,
}

impl<A: TerminalAdapter> FailureDetector<A> {
    pub fn new(terminal: Arc<A>, sampling: IdleSampling) -> Self {
        Self { terminal, sampling }
    }

    pub fn terminal(&self) -> &Arc<A> {
        &self.terminal
    }

    /// Sample the pane and return `(is_idle, final_capture)`.
    async fn sample(&self, target: &AgentTarget) -> anyhow::Result<(bool, String)> {
        let rounds = self.sampling.samples.max(1);
        let mut first_line: Option<String> = None;
        let mut identical = true;
        let mut screen = String::new();

        for round in 0..rounds {
            if round > 0 {
                tokio::time::sleep(self.sampling.interval).await;
            }
            screen = self
                .terminal
                .capture_pane(target, self.sampling.capture_lines)
                .await?;
            let line = last_line(&screen);
            match &first_line {
                None => first_line = Some(line.to_string()),
                Some(first) if first != line => identical = false,
                Some(_) => {}
            }
        }
        Ok((identical, screen))
    }

    pub async fn check_idle_status(&self, target: &AgentTarget) -> anyhow::Result<bool> {
        Ok(self.sample(target).await?.0)
    }

    pub async fn detect_failure(
        &self,
        target: &AgentTarget,
        last_response_at: DateTime<Utc>,
        consecutive_failures: u32,
        thresholds: &FailureThresholds,
    ) -> anyhow::Result<Detection> {
        let (is_idle, screen) = self.sample(target).await?;
        let failed = |reason| Detection {
            is_failed: true,
            reason,
            is_idle,
        };

        if has_critical_errors(&screen) {
            return Ok(failed(FailureReason::CriticalErrorDetected));
        }
        if consecutive_failures >= thresholds.max_failures {
            return Ok(failed(FailureReason::MaxConsecutiveFailuresReached));
        }
        let silent_for = (Utc::now() - last_response_at).to_std().unwrap_or_default();
        if silent_for > thresholds.unresponsive_after() {
            return Ok(failed(FailureReason::ExtendedUnresponsiveness));
        }
        if !has_normal_interface(&screen) && !is_idle {
            return Ok(failed(FailureReason::AbnormalInterfaceState));
        }
        Ok(Detection {
            is_failed: false,
            reason: FailureReason::Healthy,
            is_idle,
        })
    }

    /// Health snapshot for `target`. Never fails: collaborator errors become
    /// an unhealthy status with a `health_check_failed:` reason.
    pub async fn check_agent_health(
        &self,
        target: &AgentTarget,
        last_response_at: DateTime<Utc>,
        consecutive_failures: u32,
        thresholds: &FailureThresholds,
    ) -> AgentHealthStatus {
        let status = match self
            .detect_failure(target, last_response_at, consecutive_failures, thresholds)
            .await
        {
            Ok(detection) => AgentHealthStatus {
                target: target.clone(),
                is_healthy: !detection.is_failed,
                is_idle: detection.is_idle,
                failure_reason: detection.reason,
                last_check: Utc::now(),
                consecutive_failures: if detection.is_failed {
                    consecutive_failures.saturating_add(1)
                } else {
                    0
                },
            },
            Err(err) => AgentHealthStatus {
                target: target.clone(),
                is_healthy: false,
                is_idle: false,
                failure_reason: FailureReason::HealthCheckFailed(format!("{err:#}")),
                last_check: Utc::now(),
                consecutive_failures: consecutive_failures.saturating_add(1),
            },
        };

        if !status.is_healthy {
            tracing::warn!(
                target = "tmux_relay::detector",
                agent = %status.target,
                reason = %status.failure_reason,
                consecutive_failures = status.consecutive_failures,
                "agent unhealthy"
            );
        }
        status
    }
}
