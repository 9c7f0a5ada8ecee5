//! Supervisor notifications about recovery progress.
//!
//! [`NotificationManager`] enforces a per-`(target, kind)` cooldown persisted
//! as JSON so restarts of the monitor do not re-spam the supervisor. Any
//! persistence problem allows the notification through.

use std::{
    collections::BTreeMap,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{target::AgentTarget, terminal::TerminalAdapter};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RecoveryStarted,
    RecoverySuccess,
    RecoveryFailed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecoveryStarted => "recovery_started",
            Self::RecoverySuccess => "recovery_success",
            Self::RecoveryFailed => "recovery_failed",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationDecision {
    pub allow: bool,
    pub reason: String,
    pub last_sent: Option<DateTime<Utc>>,
    pub next_allowed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownFile {
    #[serde(default)]
    last_sent: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
enum Store {
    File(PathBuf),
    Memory(CooldownFile),
}

pub struct NotificationManager {
    store: Mutex<Store>,
}

impl fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationManager").finish_non_exhaustive()
    }
}

fn cooldown_key(target: &AgentTarget, kind: NotificationKind) -> String {
    format!("{target}|{kind}")
}

impl NotificationManager {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            store: Mutex::new(Store::File(path.into())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: Mutex::new(Store::Memory(CooldownFile::default())),
        }
    }

    pub fn should_send_recovery_notification(
        &self,
        target: &AgentTarget,
        kind: NotificationKind,
        cooldown: Duration,
    ) -> NotificationDecision {
        self.should_send_at(target, kind, cooldown, Utc::now())
    }

    pub fn should_send_at(
        &self,
        target: &AgentTarget,
        kind: NotificationKind,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> NotificationDecision {
        let key = cooldown_key(target, kind);
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut guard = self.store.lock();

        let mut loaded;
        let (path, state) = match &mut *guard {
            Store::Memory(state) => (None, state),
            Store::File(path) => match load(path) {
                Ok(state) => {
                    loaded = state;
                    (Some(path.as_path()), &mut loaded)
                }
                Err(err) => {
                    tracing::warn!(
                        target = "tmux_relay::notify",
                        path = %path.display(),
                        error = %err,
                        "cooldown state unreadable, allowing notification"
                    );
                    return NotificationDecision {
                        allow: true,
                        reason: format!("cooldown state unavailable ({err}), failing open"),
                        last_sent: None,
                        next_allowed_at: None,
                    };
                }
            },
        };

        let last_sent = state.last_sent.get(&key).copied();
        if let Some(last) = last_sent {
            let next_allowed = last + cooldown;
            if now < next_allowed {
                let remaining = (next_allowed - now).num_seconds().max(1);
                return NotificationDecision {
                    allow: false,
                    reason: format!("{kind} for {target} suppressed: cooldown active, {remaining}s remaining"),
                    last_sent,
                    next_allowed_at: Some(next_allowed),
                };
            }
        }

        state.last_sent.insert(key, now);
        if let Some(path) = path {
            if let Err(err) = save(path, state) {
                tracing::warn!(
                    target = "tmux_relay::notify",
                    path = %path.display(),
                    error = %err,
                    "failed to persist cooldown state"
                );
            }
        }

        NotificationDecision {
            allow: true,
            reason: match last_sent {
                Some(_) => "cooldown elapsed".to_string(),
                None => "no previous notification".to_string(),
            },
            last_sent,
            next_allowed_at: Some(now + cooldown),
        }
    }
}

fn load(path: &Path) -> anyhow::Result<CooldownFile> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(CooldownFile::default()),
        Err(err) => Err(err.into()),
    }
}

fn save(path: &Path, state: &CooldownFile) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationResult {
    pub sent: bool,
    pub reason: String,
}

/// Sends recovery notifications to a supervisor pane, subject to the
/// cooldown.
#[derive(Debug)]
pub struct RecoveryNotifier<A> {
    terminal: Arc<A>,
    supervisor: Option<AgentTarget>,
    cooldowns: NotificationManager,
    cooldown: Duration,
}

impl<A: TerminalAdapter> RecoveryNotifier<A> {
    pub fn new(
        terminal: Arc<A>,
        supervisor: Option<AgentTarget>,
        cooldowns: NotificationManager,
        cooldown: Duration,
    ) -> Self {
        Self {
            terminal,
            supervisor,
            cooldowns,
            cooldown,
        }
    }

    pub async fn notify(&self, target: &AgentTarget, kind: NotificationKind, detail: &str) -> NotificationResult {
        let Some(supervisor) = &self.supervisor else {
            return NotificationResult {
                sent: false,
                reason: "no supervisor configured".to_string(),
            };
        };

        let decision = self
            .cooldowns
            .should_send_recovery_notification(target, kind, self.cooldown);
        if !decision.allow {
            tracing::debug!(target = "tmux_relay::notify", agent = %target, %kind, reason = %decision.reason, "notification suppressed");
            return NotificationResult {
                sent: false,
                reason: decision.reason,
            };
        }

        let text = format_notification(kind, target, detail);
        match self.terminal.send_message(supervisor, &text).await {
            Ok(true) => NotificationResult {
                sent: true,
                reason: decision.reason,
            },
            Ok(false) => NotificationResult {
                sent: false,
                reason: format!("supervisor {supervisor} did not accept the message"),
            },
            Err(err) => {
                tracing::warn!(target = "tmux_relay::notify", %supervisor, error = %err, "notification delivery failed");
                NotificationResult {
                    sent: false,
                    reason: format!("delivery failed: {err}"),
                }
            }
        }
    }
}

fn format_notification(kind: NotificationKind, target: &AgentTarget, detail: &str) -> String {
    let headline = match kind {
        NotificationKind::RecoveryStarted => "recovery started",
        NotificationKind::RecoverySuccess => "recovery succeeded",
        NotificationKind::RecoveryFailed => "recovery FAILED",
    };
    if detail.is_empty() {
        format!("[tmux-relay] {target}: {headline}")
    } else {
        format!("[tmux-relay] {target}: {headline} ({detail})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::fake::FakeTerminal;

    fn target() -> AgentTarget {
        AgentTarget::parse("team:lead").unwrap()
    }

    #[test]
    fn second_notification_within_cooldown_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NotificationManager::persistent(dir.path().join("cooldowns.json"));

        let first = manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN);
        assert!(first.allow);
        let second = manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN);
        assert!(!second.allow);
        assert!(second.reason.contains("cooldown"));
        assert!(second.last_sent.is_some());
    }

    #[test]
    fn kinds_and_targets_have_independent_cooldowns() {
        let manager = NotificationManager::in_memory();
        let other = AgentTarget::parse("team:dev").unwrap();
        assert!(manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN).allow);
        assert!(manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryFailed, DEFAULT_COOLDOWN).allow);
        assert!(manager.should_send_recovery_notification(&other, NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN).allow);
    }

    #[test]
    fn cooldown_expires() {
        let manager = NotificationManager::in_memory();
        let now = Utc::now();
        let kind = NotificationKind::RecoverySuccess;
        assert!(manager.should_send_at(&target(), kind, DEFAULT_COOLDOWN, now).allow);
        assert!(!manager.should_send_at(&target(), kind, DEFAULT_COOLDOWN, now + chrono::Duration::minutes(4)).allow);
        let later = manager.should_send_at(&target(), kind, DEFAULT_COOLDOWN, now + chrono::Duration::minutes(6));
        assert!(later.allow);
        assert_eq!(later.reason, "cooldown elapsed");
    }

    #[test]
    fn state_survives_a_new_manager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cooldowns.json");
        let kind = NotificationKind::RecoveryFailed;
        assert!(NotificationManager::persistent(&path).should_send_recovery_notification(&target(), kind, DEFAULT_COOLDOWN).allow);
        assert!(!NotificationManager::persistent(&path).should_send_recovery_notification(&target(), kind, DEFAULT_COOLDOWN).allow);
    }

    #[test]
    fn corrupt_state_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        std::fs::write(&path, "{not json").unwrap();
        let manager = NotificationManager::persistent(&path);
        for _ in 0..2 {
            let decision = manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN);
            assert!(decision.allow);
            assert!(decision.reason.contains("failing open"));
        }
    }

    #[test]
    fn unreadable_path_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes reads fail with a non-NotFound error.
        let manager = NotificationManager::persistent(dir.path());
        assert!(manager.should_send_recovery_notification(&target(), NotificationKind::RecoveryStarted, DEFAULT_COOLDOWN).allow);
    }

    #[tokio::test]
    async fn notifier_sends_to_supervisor_once_per_cooldown() {
        let terminal = Arc::new(FakeTerminal::default());
        let supervisor = AgentTarget::parse("team:boss").unwrap();
        let notifier = RecoveryNotifier::new(
            Arc::clone(&terminal),
            Some(supervisor),
            NotificationManager::in_memory(),
            DEFAULT_COOLDOWN,
        );

        let first = notifier.notify(&target(), NotificationKind::RecoveryStarted, "critical_error_detected").await;
        assert!(first.sent);
        let second = notifier.notify(&target(), NotificationKind::RecoveryStarted, "again").await;
        assert!(!second.sent);

        assert_eq!(
            terminal.sent_to("team:boss"),
            vec!["[tmux-relay] team:lead: recovery started (critical_error_detected)".to_string()]
        );
    }

    #[tokio::test]
    async fn notifier_without_supervisor_is_a_no_op() {
        let terminal = Arc::new(FakeTerminal::default());
        let notifier = RecoveryNotifier::new(terminal, None, NotificationManager::in_memory(), DEFAULT_COOLDOWN);
        let result = notifier.notify(&target(), NotificationKind::RecoveryFailed, "").await;
        assert!(!result.sent);
        assert!(result.reason.contains("no supervisor"));
    }
}
