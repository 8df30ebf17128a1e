use serde::Serialize;

use crate::hash::Hash;

pub mod simulator;
pub mod source;

pub use source::HashSource;

/// Which of the three source states is active. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    Connecting,
    Live,
    Simulating,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Connecting => "connecting",
            FeedMode::Live => "live",
            FeedMode::Simulating => "simulating",
        }
    }
}

/// What the source has published so far. Written only by [`HashSource`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedState {
    pub current_hash: Hash,
    pub block_number: u64,
    pub is_live: bool,
    pub mode: FeedMode,
    /// Bumped once per published hash. Two publications of the same hash
    /// still differ here, which is what triggers a new reveal.
    pub revision: u64,
}

impl FeedState {
    pub fn genesis() -> Self {
        Self {
            current_hash: Hash::genesis(),
            block_number: 0,
            is_live: false,
            mode: FeedMode::Connecting,
            revision: 0,
        }
    }
}

impl Default for FeedState {
    fn default() -> Self {
        Self::genesis()
    }
}
