use thiserror::Error;

/// Fault taxonomy of the engine.
///
/// Only `InvalidHash` on a reveal target ever reaches the consumer as a fault;
/// the feed variants are logged and absorbed by the fallback policy, and
/// `RevealAborted` is ordinary control flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FateError {
    #[error("invalid hash: {reason}")]
    InvalidHash { reason: String },

    #[error("feed unavailable: {reason}")]
    FeedUnavailable { reason: String },

    #[error("transient feed error at height {height}: {reason}")]
    FeedTransient { height: u64, reason: String },

    #[error("reveal cycle {cycle} aborted by a newer target")]
    RevealAborted { cycle: u64 },
}

impl FateError {
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        FateError::InvalidHash {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FateError::InvalidHash { .. } => "invalid_hash",
            FateError::FeedUnavailable { .. } => "feed_unavailable",
            FateError::FeedTransient { .. } => "feed_transient",
            FateError::RevealAborted { .. } => "reveal_aborted",
        }
    }
}
