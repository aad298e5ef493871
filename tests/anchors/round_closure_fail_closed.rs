//! Anchor Test: a round that fails after it was opened is closed with the error, and a round
//! whose chain snapshot fails is never opened.

use crate::anchor_utils::{
    e18, job, miner, temp_db, FlakySwaps, Script, ScriptedChain, ScriptedExecutor, ScriptedPeers,
};
use crate::live_round_execution::seed_history;
use sn98_validator::chain::ChainClient;
use sn98_validator::core::{Inventory, RoundStatus, RoundType};
use sn98_validator::engine::SwapEventSource;
use sn98_validator::peers::roster::StaticDirectory;
use sn98_validator::peers::MinerQueryGateway;
use sn98_validator::runtime::{OrchestratorSettings, RoundOrchestrator};
use sn98_validator::storage::ValidatorDb;
use std::sync::Arc;
use std::time::Duration;

const MY_UID: u16 = 9;

fn orchestrator(
    db: &Arc<ValidatorDb>,
    swaps: Arc<dyn SwapEventSource>,
    chain: Arc<dyn ChainClient>,
) -> RoundOrchestrator {
    RoundOrchestrator::new(
        db.clone(),
        swaps,
        chain,
        Arc::new(StaticDirectory([3u16, 5, MY_UID].map(miner).to_vec())),
        MinerQueryGateway::new(
            Arc::new(ScriptedPeers::new(vec![(3, Script::Hold), (5, Script::Hold)])),
            Duration::from_millis(50),
        ),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        OrchestratorSettings {
            my_uid: Some(MY_UID),
            check_interval: 5,
            idle_poll: Duration::from_millis(5),
            ..OrchestratorSettings::default()
        },
    )
}

#[tokio::test]
async fn test_live_round_with_failed_replay_is_closed_with_the_error() {
    let db = temp_db("anchor_closure_live");
    let job = job("job-closure-live", 1);
    seed_history(&db, &job);
    let chain = Arc::new(ScriptedChain::new(2_000, Inventory::new(e18(1), e18(1))));

    let err = orchestrator(&db, Arc::new(FlakySwaps::new(db.clone(), u64::MAX)), chain)
        .run_live_round(&job)
        .await
        .expect_err("replay outage must surface");
    assert!(format!("{err:#}").contains("swap archive unavailable"));

    assert_eq!(
        db.latest_round_number_sync(&job.job_id, RoundType::Live)
            .expect("round number"),
        1
    );
    let round = db
        .round_sync("job-closure-live:live:1")
        .expect("read round")
        .expect("round row");
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.winner_uid, None);
    let performance = db
        .round_performance_sync(&round.round_id)
        .expect("read performance")
        .expect("payload");
    let error = performance["error"].as_str().expect("error text");
    assert!(error.contains("swap archive unavailable"), "{error}");
}

#[tokio::test]
async fn test_failed_chain_snapshot_opens_no_round() {
    let db = temp_db("anchor_closure_snapshot");
    let job = job("job-closure-snapshot", 1);
    seed_history(&db, &job);
    let mut chain = ScriptedChain::new(2_000, Inventory::new(e18(1), e18(1)));
    chain.fail_inventory = true;
    let chain = Arc::new(chain);

    let orchestrator = orchestrator(&db, db.clone(), chain);
    let err = orchestrator
        .run_evaluation_round(&job)
        .await
        .expect_err("inventory read failure must surface");
    assert!(format!("{err:#}").contains("getInventory reverted"));
    orchestrator
        .run_live_round(&job)
        .await
        .expect_err("inventory read failure must surface");

    // Only the seeded evaluation round exists.
    assert_eq!(
        db.latest_round_number_sync(&job.job_id, RoundType::Evaluation)
            .expect("round number"),
        1
    );
    assert_eq!(
        db.latest_round_number_sync(&job.job_id, RoundType::Live)
            .expect("round number"),
        0
    );
}
