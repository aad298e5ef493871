//! Anchor Test: an evaluation round simulates every peer, scores the accepted ones and persists
//! decisions, scores and the winner.

use crate::anchor_utils::{
    e18, job, miner, pos, swap, temp_db, FlakySwaps, Script, ScriptedChain, ScriptedExecutor,
    ScriptedPeers, PAIR,
};
use alloy::primitives::U256;
use sn98_validator::core::{Inventory, RoundStatus, RoundType};
use sn98_validator::peers::roster::StaticDirectory;
use sn98_validator::peers::MinerQueryGateway;
use sn98_validator::runtime::{OrchestratorSettings, RoundOrchestrator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const MY_UID: u16 = 9;

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        my_uid: Some(MY_UID),
        check_interval: 5,
        idle_poll: Duration::from_millis(5),
        ..OrchestratorSettings::default()
    }
}

#[tokio::test]
async fn test_evaluation_round_scores_accepted_miners_and_persists_outcome() {
    let db = temp_db("anchor_eval_round");
    let job = job("job-eval", 1);
    db.upsert_job_sync(&job).expect("upsert job");
    db.insert_swap_events_sync(PAIR, &[swap(10, 0, 1e18, -0.9e18, 1e20)])
        .expect("seed closing price");

    let chain = Arc::new(ScriptedChain::new(1_000, Inventory::new(e18(1), e18(1))));
    let tenth = U256::from(100_000_000_000_000_000u64);
    let peers = Arc::new(ScriptedPeers::new(vec![
        (1, Script::Hold),
        (2, Script::Refuse("pool too volatile")),
        (3, Script::Propose(vec![pos(-600, 600, e18(5), e18(5))])),
        (4, Script::Propose(vec![pos(-600, 600, tenth, tenth)])),
        (5, Script::Silent),
        (MY_UID, Script::Hold),
    ]));
    let roster = [1u16, 2, 3, 4, 5, MY_UID].map(miner).to_vec();
    let orchestrator = RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        chain.clone(),
        Arc::new(StaticDirectory(roster)),
        MinerQueryGateway::new(peers.clone(), Duration::from_millis(200)),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        settings(),
    );

    let summary = orchestrator
        .run_evaluation_round(&job)
        .await
        .expect("evaluation round")
        .expect("peers to evaluate");

    assert_eq!(summary.round_id, "job-eval:evaluation:1");
    assert_eq!(summary.evaluated, 5);
    let scored: HashSet<u16> = summary.scores.keys().copied().collect();
    assert_eq!(scored, HashSet::from([1, 3, 4]));
    // Equal scores and no history: lowest uid wins.
    assert_eq!(summary.winner, Some(1));

    assert_eq!(peers.queries_for(MY_UID), 0);
    assert_eq!(peers.queries_for(2), 1);
    assert_eq!(peers.queries_for(5), 1);
    assert!(peers.queries_for(1) > 1);
    let spacings: HashSet<i32> = peers
        .seen
        .lock()
        .expect("seen lock")
        .iter()
        .map(|(_, _, spacing)| *spacing)
        .collect();
    assert_eq!(spacings, HashSet::from([60]));

    let round = db
        .round_sync(&summary.round_id)
        .expect("read round")
        .expect("round row");
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.winner_uid, Some(1));
    assert_eq!(round.start_block, 1_000);
    let performance = db
        .round_performance_sync(&summary.round_id)
        .expect("read performance")
        .expect("performance payload");
    let stored = performance["scores"].as_object().expect("scores object");
    assert_eq!(stored.len(), 3);

    let over_allocated = db
        .rebalance_decision_sync(&summary.round_id, 3)
        .expect("read decision")
        .expect("decision row");
    assert!(over_allocated.accepted);
    assert_eq!(over_allocated.rebalance_history.map(|h| h.len()), Some(1));

    let rebalanced = db
        .rebalance_decision_sync(&summary.round_id, 4)
        .expect("read decision")
        .expect("decision row");
    let history = rebalanced.rebalance_history.expect("history");
    assert_eq!(history.len(), 2, "repeat proposals within tolerance must hold");
    assert!(history[1].inventory.amount0 < e18(1));

    let refused = db
        .rebalance_decision_sync(&summary.round_id, 2)
        .expect("read decision")
        .expect("decision row");
    assert!(!refused.accepted);
    assert_eq!(refused.refusal_reason.as_deref(), Some("pool too volatile"));
    let silent = db
        .rebalance_decision_sync(&summary.round_id, 5)
        .expect("read decision")
        .expect("decision row");
    assert_eq!(silent.refusal_reason.as_deref(), Some("Timeout or error"));

    let refused_score = db
        .miner_score_sync(&job.job_id, 2)
        .expect("read score")
        .expect("score row");
    assert_eq!(refused_score.total_rounds, 1);
    assert_eq!(refused_score.accepted_rounds, 0);
    assert_eq!(refused_score.evaluation_score, 0.0);
    let winner_score = db
        .miner_score_sync(&job.job_id, 1)
        .expect("read score")
        .expect("score row");
    assert_eq!(winner_score.accepted_rounds, 1);
    assert!(db
        .miner_score_sync(&job.job_id, MY_UID)
        .expect("read score")
        .is_none());
}

#[tokio::test]
async fn test_round_without_peers_is_never_opened() {
    let db = temp_db("anchor_eval_empty");
    let job = job("job-empty", 1);
    let orchestrator = RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        Arc::new(ScriptedChain::new(50, Inventory::default())),
        Arc::new(StaticDirectory(vec![miner(MY_UID)])),
        MinerQueryGateway::new(Arc::new(ScriptedPeers::default()), Duration::from_millis(50)),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        settings(),
    );

    let summary = orchestrator
        .run_evaluation_round(&job)
        .await
        .expect("empty round is not an error");
    assert!(summary.is_none());
    assert_eq!(
        db.latest_round_number_sync(&job.job_id, RoundType::Evaluation)
            .expect("round number"),
        0
    );
}

#[tokio::test]
async fn test_backtest_failure_unscores_only_that_miner() {
    let db = temp_db("anchor_eval_flaky");
    let job = job("job-flaky", 1);
    db.upsert_job_sync(&job).expect("upsert job");
    db.insert_swap_events_sync(PAIR, &[swap(10, 0, 1e18, -0.9e18, 1e20)])
        .expect("seed closing price");

    // Miners are scored in roster order, so only miner 1's replay hits the outage.
    let orchestrator = RoundOrchestrator::new(
        db.clone(),
        Arc::new(FlakySwaps::new(db.clone(), 1)),
        Arc::new(ScriptedChain::new(200, Inventory::new(e18(1), e18(1)))),
        Arc::new(StaticDirectory(vec![miner(1), miner(2)])),
        MinerQueryGateway::new(
            Arc::new(ScriptedPeers::new(vec![(1, Script::Hold), (2, Script::Hold)])),
            Duration::from_millis(50),
        ),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        settings(),
    );

    let summary = orchestrator
        .run_evaluation_round(&job)
        .await
        .expect("one failed replay must not fail the round")
        .expect("peers to evaluate");
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.scores.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(summary.winner, Some(2));

    let round = db
        .round_sync(&summary.round_id)
        .expect("read round")
        .expect("round row");
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.winner_uid, Some(2));

    let unscored = db
        .rebalance_decision_sync(&summary.round_id, 1)
        .expect("read decision")
        .expect("decision row");
    assert!(!unscored.accepted);
    let reason = unscored.refusal_reason.expect("reason");
    assert!(reason.starts_with("Backtest failed"), "{reason}");
    assert!(reason.contains("swap archive unavailable"), "{reason}");

    let failed = db
        .miner_score_sync(&job.job_id, 1)
        .expect("read score")
        .expect("score row");
    assert_eq!(failed.total_rounds, 1);
    assert_eq!(failed.accepted_rounds, 0);
    assert_eq!(failed.evaluation_score, 0.0);
    let scored = db
        .miner_score_sync(&job.job_id, 2)
        .expect("read score")
        .expect("score row");
    assert_eq!(scored.accepted_rounds, 1);
}

#[tokio::test]
async fn test_round_without_closing_price_completes_without_winner() {
    // No swaps stored: every replay lacks a closing price.
    let db = temp_db("anchor_eval_no_price");
    let job = job("job-no-price", 1);
    let orchestrator = RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        Arc::new(ScriptedChain::new(200, Inventory::new(e18(1), e18(1)))),
        Arc::new(StaticDirectory(vec![miner(1)])),
        MinerQueryGateway::new(
            Arc::new(ScriptedPeers::new(vec![(1, Script::Hold)])),
            Duration::from_millis(50),
        ),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        settings(),
    );

    let summary = orchestrator
        .run_evaluation_round(&job)
        .await
        .expect("evaluation round")
        .expect("peers to evaluate");
    assert!(summary.scores.is_empty());
    assert_eq!(summary.winner, None);

    let round = db
        .round_sync("job-no-price:evaluation:1")
        .expect("read round")
        .expect("round row");
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.winner_uid, None);
    let decision = db
        .rebalance_decision_sync(&round.round_id, 1)
        .expect("read decision")
        .expect("decision row");
    assert!(!decision.accepted);
    assert!(decision
        .refusal_reason
        .as_deref()
        .is_some_and(|r| r.contains("no pool price recorded")));
}
