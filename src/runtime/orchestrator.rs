//! Round lifecycle per job: numbering, chain snapshot, miner loops, scoring and persistence.

use crate::chain::ChainClient;
use crate::core::{unix_now_ms, Inventory, Job, MinerInfo, Position, Round, RoundStatus, RoundType};
use crate::engine::{Backtester, ScoreParams, SwapEventSource};
use crate::executor::StrategyExecutor;
use crate::peers::synapse::DEFAULT_TICK_SPACING;
use crate::peers::{MinerDirectory, MinerQueryGateway};
use crate::runtime::round_loops::{
    run_evaluation_batch, run_live_loop, score_simulation, LoopContext, DEFAULT_IDLE_POLL,
    EVALUATION_BATCH_SIZE,
};
use crate::runtime::winner::select_winner;
use crate::storage::{JobRepository, RebalanceDecision, ScoreUpdate};
use crate::utils::config::DEFAULT_REBALANCE_CHECK_INTERVAL;
use crate::utils::error::compact_error_message;
use crate::vault::VaultService;
use anyhow::Context;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub my_uid: Option<u16>,
    pub check_interval: u64,
    pub idle_poll: Duration,
    pub vault_gating: bool,
    pub score_params: ScoreParams,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            my_uid: None,
            check_interval: DEFAULT_REBALANCE_CHECK_INTERVAL,
            idle_poll: DEFAULT_IDLE_POLL,
            vault_gating: false,
            score_params: ScoreParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub round_id: String,
    pub winner: Option<u16>,
    pub scores: HashMap<u16, f64>,
    pub evaluated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSummary {
    pub round_id: String,
    pub miner_uid: u16,
    pub score: f64,
    pub score_recorded: bool,
    pub execution_failures: u32,
}

struct ChainSnapshot {
    start_block: u64,
    inventory: Inventory,
    positions: Vec<Position>,
    tick_spacing: i32,
}

pub struct RoundOrchestrator {
    repo: Arc<dyn JobRepository>,
    chain: Arc<dyn ChainClient>,
    directory: Arc<dyn MinerDirectory>,
    gateway: MinerQueryGateway,
    executor: Arc<dyn StrategyExecutor>,
    backtester: Backtester<Arc<dyn SwapEventSource>>,
    vaults: Option<Arc<VaultService>>,
    settings: OrchestratorSettings,
    round_numbers: DashMap<(String, RoundType), u64>,
}

impl RoundOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn JobRepository>,
        swaps: Arc<dyn SwapEventSource>,
        chain: Arc<dyn ChainClient>,
        directory: Arc<dyn MinerDirectory>,
        gateway: MinerQueryGateway,
        executor: Arc<dyn StrategyExecutor>,
        vaults: Option<Arc<VaultService>>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            repo,
            chain,
            directory,
            gateway,
            executor,
            backtester: Backtester::new(swaps),
            vaults,
            settings,
            round_numbers: DashMap::new(),
        }
    }

    /// Next round number for `(job, type)`, resuming after the highest persisted one.
    async fn next_round_number(&self, job_id: &str, round_type: RoundType) -> anyhow::Result<u64> {
        let key = (job_id.to_string(), round_type);
        if !self.round_numbers.contains_key(&key) {
            let persisted = self.repo.latest_round_number(job_id, round_type).await?;
            self.round_numbers.entry(key.clone()).or_insert(persisted);
        }
        let mut counter = self
            .round_numbers
            .get_mut(&key)
            .context("round counter vanished")?;
        *counter += 1;
        Ok(*counter)
    }

    async fn chain_snapshot(&self, job: &Job) -> anyhow::Result<ChainSnapshot> {
        let pool = job.pool_ref();
        let start_block = self.chain.block_number(job.chain_id).await?;
        let inventory = self.chain.inventory(&pool).await?;
        let positions = self.chain.current_positions(&pool).await?;
        let tick_spacing = match self.chain.tick_spacing(&pool).await {
            Ok(spacing) => spacing,
            Err(err) => {
                tracing::warn!(
                    "[ROUND] job {} tick spacing read failed, using {}: {}",
                    job.job_id,
                    DEFAULT_TICK_SPACING,
                    compact_error_message(&err.to_string(), 200)
                );
                DEFAULT_TICK_SPACING
            }
        };
        Ok(ChainSnapshot {
            start_block,
            inventory,
            positions,
            tick_spacing,
        })
    }

    async fn open_round(
        &self,
        job: &Job,
        round_type: RoundType,
        start_block: u64,
    ) -> anyhow::Result<Round> {
        let round_number = self.next_round_number(&job.job_id, round_type).await?;
        let round = Round {
            round_id: Round::make_id(&job.job_id, round_type, round_number),
            job_id: job.job_id.clone(),
            round_type,
            round_number,
            start_block,
            deadline_ms: unix_now_ms()
                .saturating_add(job.round_duration_seconds.saturating_mul(1_000)),
            status: RoundStatus::Active,
            winner_uid: None,
        };
        self.repo.create_round(&round).await?;
        tracing::info!(
            "[ROUND] started {} #{} for job {} at block {}",
            round_type.as_str(),
            round_number,
            job.job_id,
            start_block
        );
        Ok(round)
    }

    /// Closes a round that failed midway so it is never left active.
    async fn abandon_round(&self, round: &Round, err: &anyhow::Error) {
        let payload = json!({ "error": compact_error_message(&format!("{err:#}"), 300) });
        if let Err(close_err) = self.repo.complete_round(&round.round_id, None, &payload).await {
            tracing::error!(
                "[ROUND] failed to close {} after error: {}",
                round.round_id,
                close_err
            );
        }
    }

    async fn peers(&self) -> anyhow::Result<Vec<MinerInfo>> {
        let my_uid = self.settings.my_uid;
        let peers: Vec<MinerInfo> = self
            .directory
            .miners()
            .await?
            .into_iter()
            .filter(|m| Some(m.uid) != my_uid)
            .collect();
        if !self.settings.vault_gating {
            return Ok(peers);
        }
        let Some(vaults) = self.vaults.as_ref() else {
            return Ok(peers);
        };
        let uids: Vec<u16> = peers.iter().map(|m| m.uid).collect();
        let eligible: HashSet<u16> = vaults.filter_eligible(&uids).await.into_iter().collect();
        Ok(peers.into_iter().filter(|m| eligible.contains(&m.uid)).collect())
    }

    async fn save_decisions(&self, decisions: &[RebalanceDecision]) -> anyhow::Result<()> {
        for chunk in decisions.chunks(EVALUATION_BATCH_SIZE) {
            self.repo.save_rebalance_decisions(chunk).await?;
        }
        Ok(())
    }

    pub async fn run_evaluation_round(&self, job: &Job) -> anyhow::Result<Option<EvaluationSummary>> {
        let peers = self.peers().await?;
        if peers.is_empty() {
            tracing::warn!("[EVAL] job {}: no miners to evaluate", job.job_id);
            return Ok(None);
        }

        let snapshot = self.chain_snapshot(job).await?;
        let round = self
            .open_round(job, RoundType::Evaluation, snapshot.start_block)
            .await?;
        match self.evaluate(job, &round, peers, snapshot).await {
            Ok(summary) => Ok(Some(summary)),
            Err(err) => {
                self.abandon_round(&round, &err).await;
                Err(err)
            }
        }
    }

    async fn evaluate(
        &self,
        job: &Job,
        round: &Round,
        peers: Vec<MinerInfo>,
        snapshot: ChainSnapshot,
    ) -> anyhow::Result<EvaluationSummary> {
        let ctx = LoopContext {
            job,
            round,
            chain: self.chain.as_ref(),
            gateway: &self.gateway,
            tick_spacing: snapshot.tick_spacing,
            check_interval: self.settings.check_interval,
            idle_poll: self.settings.idle_poll,
        };
        let (mut sims, end_block) =
            run_evaluation_batch(&ctx, peers, &snapshot.positions, snapshot.inventory).await;

        // A failed backtest costs that miner its acceptance, not the round.
        let mut scores: HashMap<u16, f64> = HashMap::new();
        for sim in sims.iter_mut().filter(|s| s.accepted()) {
            let scored = score_simulation(
                &self.backtester,
                job,
                sim,
                round.start_block,
                end_block,
                self.settings.score_params,
            )
            .await;
            let (metrics, score) = match scored {
                Ok(scored) => scored,
                Err(err) => {
                    let reason = compact_error_message(&err.to_string(), 200);
                    tracing::warn!(
                        "[EVAL] {} miner {} backtest failed: {}",
                        round.round_id,
                        sim.miner.uid,
                        reason
                    );
                    sim.mark_unscored(format!("Backtest failed: {reason}"));
                    continue;
                }
            };
            tracing::debug!(
                "[EVAL] miner {} score={:.6} fees={:.6} il={:.6}",
                sim.miner.uid,
                score,
                metrics.fees_collected,
                metrics.impermanent_loss
            );
            scores.insert(sim.miner.uid, score);
        }

        let decisions: Vec<RebalanceDecision> = sims.iter().map(|s| s.decision(round)).collect();
        self.save_decisions(&decisions).await?;

        // Tie-breaks use the combined scores from before this round.
        let historic = self.repo.historic_combined_scores(&job.job_id).await?;
        let winner = select_winner(&scores, &historic);

        let mut payload = Map::new();
        for (uid, score) in &scores {
            payload.insert(uid.to_string(), json!(score));
        }
        self.repo
            .complete_round(&round.round_id, winner, &json!({ "scores": Value::Object(payload) }))
            .await?;

        let updates: Vec<ScoreUpdate> = sims
            .iter()
            .map(|sim| ScoreUpdate {
                job_id: job.job_id.clone(),
                miner_uid: sim.miner.uid,
                miner_hotkey: sim.miner.hotkey.clone(),
                round_type: RoundType::Evaluation,
                score: scores.get(&sim.miner.uid).copied().unwrap_or(0.0),
                accepted: sim.accepted(),
            })
            .collect();
        let now_ms = unix_now_ms();
        for chunk in updates.chunks(EVALUATION_BATCH_SIZE) {
            self.repo.apply_score_updates(chunk, now_ms).await?;
        }

        match winner {
            Some(uid) => tracing::info!(
                "[EVAL] {} winner miner {} (score {:.6}) among {} accepted of {}",
                round.round_id,
                uid,
                scores.get(&uid).copied().unwrap_or(0.0),
                scores.len(),
                sims.len()
            ),
            None => tracing::warn!("[EVAL] {} finished without a winner", round.round_id),
        }
        Ok(EvaluationSummary {
            round_id: round.round_id.clone(),
            winner,
            scores,
            evaluated: sims.len(),
        })
    }

    /// The best-ranked miner of the latest evaluation that may run a live round.
    async fn live_candidate(&self, job: &Job) -> anyhow::Result<Option<MinerInfo>> {
        let ranking = self.repo.latest_evaluation_ranking(&job.job_id).await?;
        if ranking.is_empty() {
            return Ok(None);
        }
        let eligible: HashSet<u16> = self
            .repo
            .eligible_miners(&job.job_id)
            .await?
            .into_iter()
            .map(|s| s.miner_uid)
            .collect();
        let roster: HashMap<u16, MinerInfo> = self
            .directory
            .miners()
            .await?
            .into_iter()
            .map(|m| (m.uid, m))
            .collect();

        for uid in ranking {
            if Some(uid) == self.settings.my_uid || !eligible.contains(&uid) {
                continue;
            }
            let Some(miner) = roster.get(&uid) else {
                continue;
            };
            if self.settings.vault_gating {
                if let Some(vaults) = self.vaults.as_ref() {
                    if !vaults.is_eligible(uid).await {
                        tracing::debug!("[LIVE] miner {} skipped: vault not eligible", uid);
                        continue;
                    }
                }
            }
            return Ok(Some(miner.clone()));
        }
        Ok(None)
    }

    pub async fn run_live_round(&self, job: &Job) -> anyhow::Result<Option<LiveSummary>> {
        let Some(miner) = self.live_candidate(job).await? else {
            tracing::info!("[LIVE] job {}: no eligible miner for a live round", job.job_id);
            return Ok(None);
        };
        let snapshot = self.chain_snapshot(job).await?;
        let round = self
            .open_round(job, RoundType::Live, snapshot.start_block)
            .await?;
        match self.run_live(job, &round, miner, snapshot).await {
            Ok(summary) => Ok(Some(summary)),
            Err(err) => {
                self.abandon_round(&round, &err).await;
                Err(err)
            }
        }
    }

    async fn run_live(
        &self,
        job: &Job,
        round: &Round,
        miner: MinerInfo,
        snapshot: ChainSnapshot,
    ) -> anyhow::Result<LiveSummary> {
        let ctx = LoopContext {
            job,
            round,
            chain: self.chain.as_ref(),
            gateway: &self.gateway,
            tick_spacing: snapshot.tick_spacing,
            check_interval: self.settings.check_interval,
            idle_poll: self.settings.idle_poll,
        };
        let outcome = run_live_loop(
            &ctx,
            miner,
            &snapshot.positions,
            snapshot.inventory,
            self.executor.as_ref(),
        )
        .await;
        let sim = &outcome.simulation;
        self.save_decisions(&[sim.decision(round)]).await?;

        let (_, score) = score_simulation(
            &self.backtester,
            job,
            sim,
            round.start_block,
            outcome.end_block,
            self.settings.score_params,
        )
        .await?;

        let score_recorded = !outcome.all_executions_failed();
        if score_recorded {
            let update = ScoreUpdate {
                job_id: job.job_id.clone(),
                miner_uid: sim.miner.uid,
                miner_hotkey: sim.miner.hotkey.clone(),
                round_type: RoundType::Live,
                score,
                accepted: true,
            };
            self.repo.apply_score_updates(&[update], unix_now_ms()).await?;
        } else {
            tracing::warn!(
                "[LIVE] {}: all {} execution(s) failed; live score for miner {} left unchanged",
                round.round_id,
                outcome.executions.len(),
                sim.miner.uid
            );
        }

        let performance = json!({
            "score": score,
            "rebalances": sim.rebalances,
            "execution_failures": sim.execution_failures,
            "executions": outcome.executions,
        });
        self.repo
            .complete_round(&round.round_id, Some(sim.miner.uid), &performance)
            .await?;
        tracing::info!(
            "[LIVE] {} completed: miner {} score {:.6}, {} rebalance(s), {} failed execution(s)",
            round.round_id,
            sim.miner.uid,
            score,
            sim.rebalances,
            sim.execution_failures
        );
        Ok(LiveSummary {
            round_id: round.round_id.clone(),
            miner_uid: sim.miner.uid,
            score,
            score_recorded,
            execution_failures: sim.execution_failures,
        })
    }
}
