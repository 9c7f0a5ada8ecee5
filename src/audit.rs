use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::recovery::RecoverySession;

/// Append-only JSONL record of finished recovery sessions.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, session: &RecoverySession) -> Result<()> {
        let line = serde_json::to_string(session)?;
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// The last `limit` sessions, oldest first. Unparseable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<RecoverySession>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut recent = VecDeque::with_capacity(limit.min(1024));
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecoverySession>(&line) {
                Ok(session) => {
                    recent.push_back(session);
                    if recent.len() > limit {
                        recent.pop_front();
                    }
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(
                target = "tmux_relay::audit",
                path = %self.path.display(),
                skipped,
                "skipped unreadable audit entries"
            );
        }
        Ok(recent.into())
    }
}
