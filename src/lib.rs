//! SN98 liquidity-strategy validator.
//!
//! Miners propose concentrated-liquidity positions for a pool; the validator replays them against
//! historical swaps, scores them, and promotes the best performer with enough tenure to a live
//! round that runs through the executor bot.

// Scoring core
pub mod core;
pub mod engine;
pub mod error;
pub mod protocols;
pub mod runtime;

// Adapters behind the core's traits
pub mod chain;
pub mod executor;
pub mod peers;
pub mod price;
pub mod storage;
pub mod utils;
pub mod vault;

pub mod config {
    pub mod chains;
}
