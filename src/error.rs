/// Errors that propagate to the direct caller.
///
/// Everything environmental (timeouts, decode failures, restart failures) is
/// reported through result values instead; see the individual modules.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid target {0:?}: expected session:window")]
    InvalidTarget(String),

    #[error("invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    /// True for caller errors that must never be retried automatically.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidTarget(_) | RelayError::InvalidFragment(_)
        )
    }
}
