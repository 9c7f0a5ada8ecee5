use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(!cfg.json_output)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
type CapturedEvents = std::sync::Arc<parking_lot::Mutex<Vec<serde_json::Value>>>;

/// Writes one JSON object per line to stderr when enabled.
#[derive(Clone, Debug, Default)]
pub struct EventEmitter {
    json_output: bool,
    #[cfg(test)]
    captured: Option<CapturedEvents>,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self {
            json_output,
            #[cfg(test)]
            captured: None,
        }
    }

    /// Emitter that records event lines in memory instead of writing them.
    #[cfg(test)]
    pub(crate) fn capturing() -> (Self, CapturedEvents) {
        let captured = CapturedEvents::default();
        let emitter = Self {
            json_output: true,
            captured: Some(std::sync::Arc::clone(&captured)),
        };
        (emitter, captured)
    }

    pub fn is_enabled(&self) -> bool {
        self.json_output
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        #[cfg(test)]
        if let Some(captured) = &self.captured {
            captured.lock().push(event_line(event_type, payload));
            return;
        }
        if !self.json_output {
            return;
        }

        let line = event_line(event_type, payload);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> serde_json::Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}
