use crate::engine::rank_miners_by_score_and_history;
use std::collections::HashMap;

/// Best accepted miner of a round. `round_scores` must hold accepted miners only.
pub fn select_winner(
    round_scores: &HashMap<u16, f64>,
    historic: &HashMap<u16, f64>,
) -> Option<u16> {
    if round_scores.is_empty() {
        return None;
    }
    let sanitized: HashMap<u16, f64> = round_scores
        .iter()
        .map(|(uid, score)| {
            let score = if score.is_nan() { f64::NEG_INFINITY } else { *score };
            (*uid, score)
        })
        .collect();
    rank_miners_by_score_and_history(&sanitized, historic)
        .first()
        .map(|(uid, _)| *uid)
}
