//! Anchor Test: round ties fall back to the persisted combined score, then to the lowest uid.

use crate::anchor_utils::{miner, temp_db};
use sn98_validator::core::RoundType;
use sn98_validator::runtime::select_winner;
use sn98_validator::storage::{blend_combined_score, ScoreUpdate};
use std::collections::HashMap;

fn update(uid: u16, score: f64, accepted: bool) -> ScoreUpdate {
    ScoreUpdate {
        job_id: "job-ties".to_string(),
        miner_uid: uid,
        miner_hotkey: miner(uid).hotkey,
        round_type: RoundType::Evaluation,
        score,
        accepted,
    }
}

#[test]
fn test_persisted_history_breaks_round_ties() {
    let db = temp_db("anchor_winner_ties");
    db.apply_score_updates_sync(&[update(4, 0.2, true), update(9, 0.8, true)], 1_000)
        .expect("first round");
    db.apply_score_updates_sync(&[update(4, 0.4, true), update(9, f64::NAN, true)], 2_000)
        .expect("second round");

    let historic = db
        .historic_combined_scores_sync("job-ties")
        .expect("historic scores");
    let expected_4 = blend_combined_score(Some(0.2), 0.4);
    assert!((historic[&4] - expected_4).abs() < 1e-12);
    // A non-finite round keeps the previous aggregate.
    assert!((historic[&9] - 0.8).abs() < 1e-12);

    let round = HashMap::from([(4u16, 1.5), (9, 1.5), (11, 1.5), (2, f64::NAN)]);
    assert_eq!(select_winner(&round, &historic), Some(9));

    let no_history = HashMap::new();
    assert_eq!(select_winner(&round, &no_history), Some(4));
}

#[test]
fn test_refused_round_counts_without_touching_the_aggregate() {
    let db = temp_db("anchor_winner_refused");
    db.apply_score_updates_sync(&[update(3, 0.5, true)], 1_000)
        .expect("accepted round");
    db.apply_score_updates_sync(&[update(3, 0.0, false)], 2_000)
        .expect("refused round");

    let score = db
        .miner_score_sync("job-ties", 3)
        .expect("read score")
        .expect("score row");
    assert_eq!(score.total_rounds, 2);
    assert_eq!(score.accepted_rounds, 1);
    assert_eq!(score.evaluation_score, 0.0);
    assert!((score.combined_score - 0.5).abs() < 1e-12);
    assert_eq!(score.last_participation_ms, Some(1_000));
}
