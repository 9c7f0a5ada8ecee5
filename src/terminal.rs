use std::{future::Future, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{process::Command, time::timeout};

use crate::{
    recovery::{RestartExecutor, RestartOutcome},
    target::AgentTarget,
};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Access to the terminal multiplexer hosting the agents.
///
/// Every call may be slow or fail; callers translate errors into their own
/// result values.
pub trait TerminalAdapter: Send + Sync {
    /// Last `lines` lines of the pane's visible output.
    fn capture_pane(
        &self,
        target: &AgentTarget,
        lines: usize,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Type `text` into the pane followed by Enter.
    fn send_message(
        &self,
        target: &AgentTarget,
        text: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Send an interrupt (Ctrl-C) to the pane.
    fn send_interrupt(&self, target: &AgentTarget) -> impl Future<Output = Result<()>> + Send;

    fn list_sessions(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn list_windows(&self, session: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn has_session(&self, session: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// [`TerminalAdapter`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxCli {
    binary: String,
    command_timeout: Duration,
}

impl Default for TmuxCli {
    fn default() -> Self {
        Self::new("tmux", DEFAULT_COMMAND_TIMEOUT)
    }
}

impl TmuxCli {
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let subcommand = args.first().copied().unwrap_or_default();
        match timeout(self.command_timeout, cmd.output()).await {
            Ok(output) => output.with_context(|| format!("failed to run `{} {subcommand}`", self.binary)),
            Err(_) => anyhow::bail!(
                "`{} {subcommand}` timed out after {}s",
                self.binary,
                self.command_timeout.as_secs()
            ),
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "`{} {}` exited with code {:?}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn split_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `send-keys` arguments that type `text` literally, even when it starts
/// with a dash.
fn literal_keys_args<'a>(target: &'a str, text: &'a str) -> [&'a str; 6] {
    ["send-keys", "-t", target, "-l", "--", text]
}

fn is_no_server(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("no server running") || stderr.contains("error connecting")
}

impl TerminalAdapter for TmuxCli {
    async fn capture_pane(&self, target: &AgentTarget, lines: usize) -> Result<String> {
        let target = target.to_string();
        let start = format!("-{lines}");
        self.run_checked(&["capture-pane", "-p", "-t", &target, "-S", &start])
            .await
    }

    async fn send_message(&self, target: &AgentTarget, text: &str) -> Result<bool> {
        let target = target.to_string();
        let typed = self.run(&literal_keys_args(&target, text)).await?;
        if !typed.status.success() {
            tracing::warn!(
                target = "tmux_relay::terminal",
                pane = %target,
                stderr = %String::from_utf8_lossy(&typed.stderr).trim(),
                "send-keys failed"
            );
            return Ok(false);
        }
        let entered = self.run(&["send-keys", "-t", &target, "Enter"]).await?;
        Ok(entered.status.success())
    }

    async fn send_interrupt(&self, target: &AgentTarget) -> Result<()> {
        let target = target.to_string();
        self.run_checked(&["send-keys", "-t", &target, "C-c"]).await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if output.status.success() {
            Ok(split_names(&String::from_utf8_lossy(&output.stdout)))
        } else if is_no_server(&output.stderr) {
            Ok(Vec::new())
        } else {
            anyhow::bail!(
                "tmux list-sessions failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(&["list-windows", "-t", session, "-F", "#{window_name}"])
            .await?;
        Ok(split_names(&stdout))
    }

    async fn has_session(&self, session: &str) -> Result<bool> {
        let output = self.run(&["has-session", "-t", session]).await?;
        Ok(output.status.success())
    }
}

#[derive(Debug, Clone)]
pub struct RestartSettings {
    /// Command typed into the pane to relaunch the agent.
    pub agent_command: String,
    /// Pause after interrupting and after relaunching.
    pub settle_delay: Duration,
    /// Pane lines captured before the restart and replayed afterwards.
    pub context_lines: usize,
    pub attempt_timeout: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            settle_delay: Duration::from_secs(2),
            context_lines: 20,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Restarts an agent in place: interrupt, relaunch, then replay the
/// briefing and the output captured just before the restart.
#[derive(Debug)]
pub struct TmuxRestarter<A> {
    terminal: Arc<A>,
    settings: RestartSettings,
}

impl<A: TerminalAdapter> TmuxRestarter<A> {
    pub fn new(terminal: Arc<A>, settings: RestartSettings) -> Self {
        Self { terminal, settings }
    }

    async fn restart_inner(&self, target: &AgentTarget, briefing: Option<&str>) -> Result<RestartOutcome> {
        if !self.terminal.has_session(target.session()).await? {
            return Ok(RestartOutcome::failed(format!(
                "session '{}' does not exist",
                target.session()
            )));
        }

        let preserved = if self.settings.context_lines > 0 {
            self.terminal
                .capture_pane(target, self.settings.context_lines)
                .await
                .unwrap_or_default()
        } else {
            String::new()
        };

        self.terminal.send_interrupt(target).await?;
        tokio::time::sleep(self.settings.settle_delay).await;

        if !self
            .terminal
            .send_message(target, &self.settings.agent_command)
            .await?
        {
            return Ok(RestartOutcome::failed(format!(
                "could not launch '{}' in {target}",
                self.settings.agent_command
            )));
        }
        tokio::time::sleep(self.settings.settle_delay).await;

        if let Some(text) = restart_briefing(briefing, &preserved) {
            if !self.terminal.send_message(target, &text).await? {
                return Ok(RestartOutcome::failed(format!(
                    "agent relaunched in {target} but briefing delivery failed"
                )));
            }
        }

        Ok(RestartOutcome::succeeded(format!(
            "agent relaunched in {target} with '{}'",
            self.settings.agent_command
        )))
    }
}

impl<A: TerminalAdapter> RestartExecutor for TmuxRestarter<A> {
    async fn restart_agent(&self, target: &AgentTarget, briefing: Option<&str>) -> Result<RestartOutcome> {
        match timeout(self.settings.attempt_timeout, self.restart_inner(target, briefing)).await {
            Ok(result) => result,
            Err(_) => Ok(RestartOutcome::failed(format!(
                "restart of {target} timed out after {}s",
                self.settings.attempt_timeout.as_secs()
            ))),
        }
    }
}

/// Text replayed into a relaunched agent, if any.
fn restart_briefing(briefing: Option<&str>, preserved: &str) -> Option<String> {
    let tail: Vec<&str> = preserved
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let briefing = briefing.map(str::trim).filter(|b| !b.is_empty());

    match (briefing, tail.is_empty()) {
        (None, true) => None,
        (Some(b), true) => Some(b.to_string()),
        (b, false) => {
            let mut text = b.map(|b| format!("{b}\n\n")).unwrap_or_default();
            text.push_str("Output before restart:\n");
            text.push_str(&tail.join("\n"));
            Some(text)
        }
    }
}
