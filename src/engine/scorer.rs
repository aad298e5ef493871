use crate::core::PerformanceMetrics;
use crate::protocols::uniswap_v3::u256_to_f64;
use alloy::primitives::U256;
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_LOSS_PENALTY_MULTIPLIER: f64 = 10.0;
pub const DEFAULT_SMOOTH_BETA: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    /// Strength `k` of the `exp(-k * loss)` penalty.
    pub loss_penalty_multiplier: f64,
    /// Sharpness of the soft max over per-token loss ratios.
    pub smooth_beta: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            loss_penalty_multiplier: DEFAULT_LOSS_PENALTY_MULTIPLIER,
            smooth_beta: DEFAULT_SMOOTH_BETA,
        }
    }
}

fn loss_ratio(initial: U256, final_amount: U256) -> f64 {
    if initial.is_zero() {
        return 0.0;
    }
    let loss = initial.saturating_sub(final_amount);
    u256_to_f64(loss) / u256_to_f64(initial)
}

/// Log-sum-exp of two ratios. Tends to `max` as `beta` grows.
pub fn smooth_max(r0: f64, r1: f64, beta: f64) -> f64 {
    let m = r0.max(r1);
    m + (1.0 / beta) * ((beta * (r0 - m)).exp() + (beta * (r1 - m)).exp()).ln()
}

/// Applies the inventory-loss penalty to a value gain. The penalty always moves the score down,
/// whichever sign the gain has.
pub fn penalized_score(value_gain: f64, loss_ratio0: f64, loss_ratio1: f64, params: ScoreParams) -> f64 {
    let combined = smooth_max(loss_ratio0, loss_ratio1, params.smooth_beta);
    let penalty = (-params.loss_penalty_multiplier * combined).exp();
    if value_gain >= 0.0 {
        value_gain * penalty
    } else {
        value_gain / penalty
    }
}

pub fn score_pol_strategy(metrics: &PerformanceMetrics, params: ScoreParams) -> f64 {
    if !(metrics.initial_value > 0.0) {
        return f64::NEG_INFINITY;
    }
    let ratio0 = loss_ratio(
        metrics.initial_inventory.amount0,
        metrics.final_inventory.amount0,
    );
    let ratio1 = loss_ratio(
        metrics.initial_inventory.amount1,
        metrics.final_inventory.amount1,
    );
    let value_gain = metrics.final_value - metrics.initial_value;
    penalized_score(value_gain, ratio0, ratio1, params)
}

/// Orders miners by this round's score, then by historic combined score (absent history counts
/// as 0), then by uid.
pub fn rank_miners_by_score_and_history(
    round_scores: &HashMap<u16, f64>,
    historic: &HashMap<u16, f64>,
) -> Vec<(u16, f64)> {
    let mut ranked: Vec<(u16, f64)> = round_scores.iter().map(|(uid, s)| (*uid, *s)).collect();
    ranked.sort_by(|(uid_a, score_a), (uid_b, score_b)| {
        let hist_a = historic.get(uid_a).copied().unwrap_or(0.0);
        let hist_b = historic.get(uid_b).copied().unwrap_or(0.0);
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| hist_b.partial_cmp(&hist_a).unwrap_or(Ordering::Equal))
            .then_with(|| uid_a.cmp(uid_b))
    });
    ranked
}
