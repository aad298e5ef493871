//! Anchor Test: the supervisor keeps exactly one task per active job and stops on shutdown.

use crate::anchor_utils::{job, temp_db, ScriptedChain, ScriptedExecutor, ScriptedPeers};
use sn98_validator::core::{Inventory, Job};
use sn98_validator::peers::roster::StaticDirectory;
use sn98_validator::peers::MinerQueryGateway;
use sn98_validator::runtime::{JobSupervisor, OrchestratorSettings, RoundOrchestrator};
use sn98_validator::storage::ValidatorDb;
use std::sync::Arc;
use std::time::Duration;

fn idle_supervisor(db: &Arc<ValidatorDb>) -> JobSupervisor {
    // Nobody to evaluate and no ranking: every cycle is a no-op followed by a long sleep.
    let orchestrator = Arc::new(RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        Arc::new(ScriptedChain::new(1, Inventory::default())),
        Arc::new(StaticDirectory(Vec::new())),
        MinerQueryGateway::new(Arc::new(ScriptedPeers::default()), Duration::from_millis(50)),
        Arc::new(ScriptedExecutor::new(true)),
        None,
        OrchestratorSettings::default(),
    ));
    JobSupervisor::new(db.clone(), orchestrator, None, Duration::from_millis(20))
}

fn inactive(mut job: Job) -> Job {
    job.is_active = false;
    job
}

#[tokio::test]
async fn test_reconcile_starts_and_stops_job_tasks() {
    let db = temp_db("anchor_supervisor_reconcile");
    let supervisor = idle_supervisor(&db);
    let a = job("job-a", 3_600);
    let b = job("job-b", 3_600);

    supervisor.reconcile(&[a.clone(), b.clone()]);
    supervisor.reconcile(&[a.clone(), b.clone()]);
    assert_eq!(supervisor.running_jobs(), vec!["job-a".to_string(), "job-b".to_string()]);

    supervisor.reconcile(&[a.clone(), inactive(b)]);
    assert_eq!(supervisor.running_jobs(), vec!["job-a".to_string()]);

    supervisor.reconcile(&[]);
    assert!(supervisor.running_jobs().is_empty());
}

#[tokio::test]
async fn test_run_picks_up_stored_jobs_and_exits_on_shutdown() {
    let db = temp_db("anchor_supervisor_run");
    db.upsert_job_sync(&job("job-stored", 3_600)).expect("upsert job");
    let supervisor = idle_supervisor(&db);
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(());
    });
    tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown_rx))
        .await
        .expect("supervisor stops after shutdown");
    stopper.await.expect("stopper task");
    assert!(supervisor.running_jobs().is_empty());
}
