use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use tmux_relay::{
    audit::AuditLog,
    config::{Command, Config},
    detector::FailureDetector,
    events::EventEmitter,
    monitor::HealthMonitor,
    notify::{NotificationManager, RecoveryNotifier},
    recovery::RecoveryCoordinator,
    terminal::{TmuxCli, TmuxRestarter, DEFAULT_COMMAND_TIMEOUT},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    tmux_relay::events::init_logging(&cfg)?;

    match cfg.command.clone().unwrap_or(Command::Monitor) {
        Command::History { limit } => run_history(&cfg, limit),
        Command::Check => run_check(&cfg).await,
        Command::Monitor => run_monitor(&cfg).await,
    }
}

fn run_history(cfg: &Config, limit: usize) -> Result<()> {
    let audit = AuditLog::new(cfg.audit_path());
    let sessions = audit
        .read_recent(limit)
        .with_context(|| format!("failed to read {}", audit.path().display()))?;
    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}

async fn run_check(cfg: &Config) -> Result<()> {
    let monitor = build_monitor(cfg)?;
    let statuses = monitor.check_all().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn run_monitor(cfg: &Config) -> Result<()> {
    let monitor = build_monitor(cfg)?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    };

    monitor.run(shutdown).await;
    Ok(())
}

fn build_monitor(cfg: &Config) -> Result<HealthMonitor<TmuxCli, TmuxRestarter<TmuxCli>>> {
    let targets = cfg.agent_targets().context("--targets must name at least one session:window")?;
    let supervisor = cfg.supervisor_target()?;
    let events = EventEmitter::new(cfg.json_output);

    let terminal = Arc::new(TmuxCli::new(cfg.tmux_binary.clone(), DEFAULT_COMMAND_TIMEOUT));
    let detector = FailureDetector::new(Arc::clone(&terminal), cfg.idle_sampling());
    let restarter = Arc::new(TmuxRestarter::new(Arc::clone(&terminal), cfg.restart_settings()));
    let notifier = RecoveryNotifier::new(
        Arc::clone(&terminal),
        supervisor,
        NotificationManager::persistent(cfg.cooldown_path()),
        cfg.notification_cooldown(),
    );
    let coordinator = RecoveryCoordinator::new(detector, restarter, notifier)
        .with_audit_log(AuditLog::new(cfg.audit_path()))
        .with_events(events.clone());

    tracing::info!(
        targets = targets.len(),
        state_dir = %cfg.state_dir().display(),
        "tmux-relay configured"
    );

    Ok(HealthMonitor::new(coordinator, targets, cfg.recovery_options(), cfg.interval()).with_events(events))
}
