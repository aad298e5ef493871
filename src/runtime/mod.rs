//! Job supervision: one long-lived task per active job, plus a periodic vault sync.

pub mod orchestrator;
pub mod round_loops;
pub mod winner;

pub use orchestrator::{EvaluationSummary, LiveSummary, OrchestratorSettings, RoundOrchestrator};
pub use round_loops::{LoopStatus, MinerSimulation, EVALUATION_BATCH_SIZE, REBALANCE_TOLERANCE};
pub use winner::select_winner;

use crate::core::Job;
use crate::peers::{MinerDirectory, PeerClient};
use crate::storage::JobRepository;
use crate::utils::error::compact_error_message;
use crate::utils::rpc::{bounded_exponential_backoff_ms, is_rate_limited_rpc_error};
use crate::vault::VaultService;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const JOB_ERROR_BACKOFF_BASE_MS: u64 = 5_000;
const JOB_RATE_LIMIT_BACKOFF_BASE_MS: u64 = 15_000;
const JOB_ERROR_BACKOFF_CAP_MS: u64 = 300_000;

/// Inputs for the vault sync that runs on every monitor tick.
pub struct VaultSync {
    pub service: Arc<VaultService>,
    pub directory: Arc<dyn MinerDirectory>,
    pub client: Arc<dyn PeerClient>,
    pub timeout: Duration,
}

pub struct JobSupervisor {
    repo: Arc<dyn JobRepository>,
    orchestrator: Arc<RoundOrchestrator>,
    vault_sync: Option<VaultSync>,
    monitor_interval: Duration,
    tasks: Arc<DashMap<String, JoinHandle<()>>>,
}

impl JobSupervisor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        orchestrator: Arc<RoundOrchestrator>,
        vault_sync: Option<VaultSync>,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            repo,
            orchestrator,
            vault_sync,
            monitor_interval,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Job ids with a live task, sorted.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Aborts tasks of jobs no longer active and (re)starts tasks for active jobs whose task is
    /// missing or has exited.
    pub fn reconcile(&self, jobs: &[Job]) {
        let active: HashSet<&str> = jobs
            .iter()
            .filter(|j| j.is_active)
            .map(|j| j.job_id.as_str())
            .collect();

        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| !active.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for job_id in stale {
            if let Some((_, handle)) = self.tasks.remove(&job_id) {
                handle.abort();
                tracing::info!("[SCHED] job {} inactive; task stopped", job_id);
            }
        }

        for job in jobs.iter().filter(|j| j.is_active) {
            if let Some(handle) = self.tasks.get(&job.job_id) {
                if !handle.is_finished() {
                    continue;
                }
                tracing::warn!("[SCHED] job {} task exited; restarting", job.job_id);
            } else {
                tracing::info!(
                    "[SCHED] starting job {} (round duration {}s)",
                    job.job_id,
                    job.round_duration_seconds
                );
            }
            let handle = tokio::spawn(run_job_forever(self.orchestrator.clone(), job.clone()));
            self.tasks.insert(job.job_id.clone(), handle);
        }
    }

    async fn monitor_tick(&self) {
        let jobs = match self.repo.active_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(
                    "[SCHED] failed to load active jobs: {}",
                    compact_error_message(&format!("{err:#}"), 300)
                );
                return;
            }
        };
        self.reconcile(&jobs);

        let Some(sync) = self.vault_sync.as_ref() else {
            return;
        };
        let peers = match sync.directory.miners().await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::warn!("[VAULT] roster unavailable for sync: {}", err);
                return;
            }
        };
        if let Err(err) = sync
            .service
            .sync_miner_vaults(&peers, sync.client.clone(), sync.timeout, &jobs)
            .await
        {
            tracing::warn!(
                "[VAULT] sync failed: {}",
                compact_error_message(&format!("{err:#}"), 300)
            );
        }
    }

    /// Runs until `shutdown` fires, then aborts every job task.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_tick().await,
                _ = shutdown.recv() => {
                    tracing::info!("[SCHED] shutdown requested; stopping {} job task(s)", self.tasks.len());
                    break;
                }
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Delay after a failed cycle. Rate-limit failures start from a longer base.
pub fn job_error_backoff_ms(streak: u32, last_error: &str) -> u64 {
    let base = if is_rate_limited_rpc_error(last_error) {
        JOB_RATE_LIMIT_BACKOFF_BASE_MS
    } else {
        JOB_ERROR_BACKOFF_BASE_MS
    };
    bounded_exponential_backoff_ms(base, streak.saturating_sub(1), JOB_ERROR_BACKOFF_CAP_MS)
}

async fn run_job_forever(orchestrator: Arc<RoundOrchestrator>, job: Job) {
    let mut error_streak = 0u32;
    loop {
        let (evaluation, live) = tokio::join!(
            orchestrator.run_evaluation_round(&job),
            orchestrator.run_live_round(&job)
        );
        let mut failure: Option<String> = None;
        if let Err(err) = evaluation {
            let message = compact_error_message(&format!("{err:#}"), 300);
            tracing::error!("[EVAL] job {} round failed: {}", job.job_id, message);
            failure = Some(message);
        }
        if let Err(err) = live {
            let message = compact_error_message(&format!("{err:#}"), 300);
            tracing::error!("[LIVE] job {} round failed: {}", job.job_id, message);
            failure = Some(message);
        }

        let pause_ms = match failure {
            Some(message) => {
                error_streak = error_streak.saturating_add(1);
                let backoff = job_error_backoff_ms(error_streak, &message);
                tracing::warn!(
                    "[SCHED] job {} backing off {}ms after {} failed cycle(s)",
                    job.job_id,
                    backoff,
                    error_streak
                );
                backoff
            }
            None => {
                error_streak = 0;
                job.round_duration_seconds.saturating_mul(1_000)
            }
        };
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }
}
