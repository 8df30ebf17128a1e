//! Fate engine: Ethereum block hashes turned into I Ching hexagrams, revealed
//! through a short run of decoys.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod hash;
pub mod hexagram;
pub mod logging;
pub mod reliability;
pub mod reveal;
pub mod scheduler;
pub mod upstream;
