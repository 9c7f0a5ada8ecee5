use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::{
    detector::{FailureThresholds, IdleSampling},
    error::RelayError,
    recovery::RecoveryOptions,
    target::{parse_target_list, AgentTarget},
    terminal::RestartSettings,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "tmux-relay")]
#[command(about = "Watches tmux-hosted agents and restarts the ones that fail")]
pub struct Config {
    /// Comma separated `session:window` targets to watch.
    #[arg(long, default_value = "")]
    pub targets: String,

    /// `session:window` that receives recovery notifications.
    #[arg(long)]
    pub supervisor: Option<String>,

    #[arg(long, default_value_t = 30)]
    pub interval_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub max_failures: u32,

    #[arg(long, default_value_t = 60)]
    pub response_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub recovery_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub restart_attempt_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub notification_cooldown_minutes: u64,

    #[arg(long, default_value_t = 3)]
    pub parallel_limit: usize,

    #[arg(long, default_value_t = false)]
    pub no_auto_restart: bool,

    #[arg(long, default_value = "claude")]
    pub agent_command: String,

    /// Text replayed into an agent after it is restarted.
    #[arg(long)]
    pub briefing: Option<String>,

    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    #[arg(long, default_value = "tmux")]
    pub tmux_binary: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the monitoring loop (default).
    Monitor,
    /// Check each target once and print the results as JSON.
    Check,
    /// Print the most recent recovery sessions from the audit log.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl Config {
    pub fn agent_targets(&self) -> Result<Vec<AgentTarget>, RelayError> {
        let targets = parse_target_list(&self.targets)?;
        if targets.is_empty() {
            return Err(RelayError::InvalidTarget(self.targets.clone()));
        }
        Ok(targets)
    }

    pub fn supervisor_target(&self) -> Result<Option<AgentTarget>, RelayError> {
        self.supervisor.as_deref().map(AgentTarget::parse).transpose()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tmux-relay")
        })
    }

    pub fn cooldown_path(&self) -> PathBuf {
        self.state_dir().join("notification-cooldowns.json")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir().join("recovery-audit.jsonl")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_minutes * 60)
    }

    pub fn thresholds(&self) -> FailureThresholds {
        FailureThresholds {
            max_failures: self.max_failures,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
        }
    }

    pub fn idle_sampling(&self) -> IdleSampling {
        IdleSampling::default()
    }

    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            thresholds: self.thresholds(),
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            restart_attempt_timeout: Duration::from_secs(self.restart_attempt_timeout_secs),
            enable_auto_restart: !self.no_auto_restart,
            briefing: self.briefing.clone(),
            parallel_limit: self.parallel_limit.max(1),
        }
    }

    pub fn restart_settings(&self) -> RestartSettings {
        RestartSettings {
            agent_command: self.agent_command.clone(),
            attempt_timeout: Duration::from_secs(self.restart_attempt_timeout_secs),
            ..RestartSettings::default()
        }
    }
}
