//! Anchor Test: live rounds promote the best eligible miner, execute through the gateway and only
//! commit what the executor confirmed.

use crate::anchor_utils::{
    e18, job, miner, pos, swap, temp_db, Script, ScriptedChain, ScriptedExecutor, ScriptedPeers,
    PAIR,
};
use alloy::primitives::U256;
use serde_json::json;
use sn98_validator::core::{unix_now_ms, Inventory, Job, Round, RoundStatus, RoundType, MS_PER_DAY};
use sn98_validator::peers::roster::StaticDirectory;
use sn98_validator::peers::MinerQueryGateway;
use sn98_validator::runtime::{OrchestratorSettings, RoundOrchestrator};
use sn98_validator::storage::{ScoreUpdate, ValidatorDb};
use std::sync::Arc;
use std::time::Duration;

const MY_UID: u16 = 9;

/// A completed evaluation ranking 9 > 3 > 5, with 3, 5 and 9 past the tenure threshold.
pub fn seed_history(db: &ValidatorDb, job: &Job) {
    db.upsert_job_sync(job).expect("upsert job");
    db.insert_swap_events_sync(PAIR, &[swap(10, 0, 1e18, -0.9e18, 1e20)])
        .expect("seed closing price");

    let round = Round {
        round_id: Round::make_id(&job.job_id, RoundType::Evaluation, 1),
        job_id: job.job_id.clone(),
        round_type: RoundType::Evaluation,
        round_number: 1,
        start_block: 1,
        deadline_ms: 0,
        status: RoundStatus::Active,
        winner_uid: None,
    };
    db.create_round_sync(&round).expect("create evaluation round");
    db.complete_round_sync(
        &round.round_id,
        Some(MY_UID),
        &json!({ "scores": { "9": 5.0, "7": 4.0, "3": 2.0, "5": 1.0, "6": null } }),
    )
    .expect("complete evaluation round");

    let tenure_start = unix_now_ms().saturating_sub(8 * MS_PER_DAY);
    let updates: Vec<ScoreUpdate> = [3u16, 5, MY_UID]
        .iter()
        .map(|&uid| ScoreUpdate {
            job_id: job.job_id.clone(),
            miner_uid: uid,
            miner_hotkey: miner(uid).hotkey,
            round_type: RoundType::Evaluation,
            score: 1.0,
            accepted: true,
        })
        .collect();
    db.apply_score_updates_sync(&updates, tenure_start)
        .expect("seed tenure");
}

fn orchestrator(
    db: &Arc<ValidatorDb>,
    peers: Arc<ScriptedPeers>,
    executor: Arc<ScriptedExecutor>,
) -> RoundOrchestrator {
    // Miner 7 ranks above 3 but is missing from the roster.
    let roster = [3u16, 5, MY_UID].map(miner).to_vec();
    RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        Arc::new(ScriptedChain::new(2_000, Inventory::new(e18(1), e18(1)))),
        Arc::new(StaticDirectory(roster)),
        MinerQueryGateway::new(peers, Duration::from_millis(200)),
        executor,
        None,
        OrchestratorSettings {
            my_uid: Some(MY_UID),
            check_interval: 5,
            idle_poll: Duration::from_millis(5),
            ..OrchestratorSettings::default()
        },
    )
}

fn proposal() -> Script {
    let tenth = U256::from(100_000_000_000_000_000u64);
    Script::Propose(vec![pos(-600, 600, tenth, tenth)])
}

#[tokio::test]
async fn test_confirmed_execution_is_committed_and_scored() {
    let db = temp_db("anchor_live_ok");
    let job = job("job-live", 1);
    seed_history(&db, &job);
    let peers = Arc::new(ScriptedPeers::new(vec![(3, proposal()), (5, Script::Hold)]));
    let executor = Arc::new(ScriptedExecutor::new(true));

    let summary = orchestrator(&db, peers.clone(), executor.clone())
        .run_live_round(&job)
        .await
        .expect("live round")
        .expect("eligible candidate");

    assert_eq!(summary.miner_uid, 3);
    assert_eq!(summary.round_id, "job-live:live:1");
    assert!(summary.score_recorded);
    assert_eq!(summary.execution_failures, 0);
    assert_eq!(executor.calls(), 1, "held proposals are not re-executed");
    assert_eq!(peers.queries_for(5), 0);

    let decision = db
        .rebalance_decision_sync(&summary.round_id, 3)
        .expect("read decision")
        .expect("decision row");
    let history = decision.rebalance_history.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].execution_id, Some(1));
    assert!(history[1].tx_hash.is_some());

    let score = db
        .miner_score_sync(&job.job_id, 3)
        .expect("read score")
        .expect("score row");
    assert_eq!(score.total_rounds, 2);
    assert_eq!(score.live_score, summary.score);

    let round = db
        .round_sync(&summary.round_id)
        .expect("read round")
        .expect("round row");
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.winner_uid, Some(3));
}

#[tokio::test]
async fn test_all_failed_executions_leave_live_score_untouched() {
    let db = temp_db("anchor_live_failed");
    let job = job("job-live-fail", 1);
    seed_history(&db, &job);
    let peers = Arc::new(ScriptedPeers::new(vec![(3, proposal())]));
    let executor = Arc::new(ScriptedExecutor::new(false));

    let summary = orchestrator(&db, peers, executor.clone())
        .run_live_round(&job)
        .await
        .expect("live round")
        .expect("eligible candidate");

    assert!(!summary.score_recorded);
    assert!(executor.calls() >= 1);
    assert_eq!(summary.execution_failures as usize, executor.calls());

    let decision = db
        .rebalance_decision_sync(&summary.round_id, 3)
        .expect("read decision")
        .expect("decision row");
    assert_eq!(decision.rebalance_history.map(|h| h.len()), Some(1));

    let score = db
        .miner_score_sync(&job.job_id, 3)
        .expect("read score")
        .expect("score row");
    assert_eq!(score.total_rounds, 1);
    assert_eq!(score.live_score, 0.0);

    let performance = db
        .round_performance_sync(&summary.round_id)
        .expect("read performance")
        .expect("payload");
    let executions = performance["executions"].as_array().expect("executions");
    assert_eq!(executions.len(), executor.calls());
    assert!(executions.iter().all(|e| e["success"] == json!(false)));
}

#[tokio::test]
async fn test_no_live_round_without_a_tenured_candidate() {
    let db = temp_db("anchor_live_none");
    let job = job("job-live-none", 1);
    db.upsert_job_sync(&job).expect("upsert job");
    let summary = orchestrator(
        &db,
        Arc::new(ScriptedPeers::default()),
        Arc::new(ScriptedExecutor::new(true)),
    )
    .run_live_round(&job)
    .await
    .expect("no candidate is not an error");
    assert!(summary.is_none());
    assert_eq!(
        db.latest_round_number_sync(&job.job_id, RoundType::Live)
            .expect("round number"),
        0
    );
}
