use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open key-value map carried by envelopes and queued messages.
pub type Metadata = Map<String, Value>;

/// Delivery priority, 1 (highest) through 10 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const HIGH: Priority = Priority(3);
    pub const NORMAL: Priority = Priority(5);
    pub const LOWEST: Priority = Priority(10);

    /// Out-of-range values are clamped into `1..=10`.
    pub fn new(value: u8) -> Self {
        Self(value.clamp(Self::HIGHEST.0, Self::LOWEST.0))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Zero-based bucket index used by the priority queue.
    pub(crate) fn index(self) -> usize {
        (self.0 - Self::HIGHEST.0) as usize
    }

    pub(crate) const LEVELS: usize = 10;
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
