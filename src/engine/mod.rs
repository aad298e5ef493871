//! Strategy evaluation: swap replay and scoring.

pub mod backtester;
pub mod scorer;

pub use backtester::{Backtester, SwapEvent, SwapEventSource};
pub use scorer::{rank_miners_by_score_and_history, score_pol_strategy, ScoreParams};
