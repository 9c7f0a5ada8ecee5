use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

static TARGET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s:]+):([^\s:]+)$").expect("valid regex"));

/// An addressable agent in `session:window` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentTarget {
    session: String,
    window: String,
}

impl AgentTarget {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let caps = TARGET_PATTERN
            .captures(raw.trim())
            .ok_or_else(|| RelayError::InvalidTarget(raw.to_string()))?;
        Ok(Self {
            session: caps[1].to_string(),
            window: caps[2].to_string(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn window(&self) -> &str {
        &self.window
    }
}

impl fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

impl FromStr for AgentTarget {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentTarget {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentTarget> for String {
    fn from(value: AgentTarget) -> Self {
        value.to_string()
    }
}

/// Parse a comma separated target list, skipping blanks.
pub fn parse_target_list(raw: &str) -> Result<Vec<AgentTarget>, RelayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(AgentTarget::parse)
        .collect()
}
