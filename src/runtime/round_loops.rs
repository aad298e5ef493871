//! Block-driven simulation loops for evaluation and live rounds.
//!
//! Every miner carries its own positions, inventory and rebalance history. At each check block the
//! miner is shown that state and may propose new positions. Evaluation rounds only simulate;
//! live rounds push accepted proposals through the execution gateway before committing them.

use crate::chain::ChainClient;
use crate::core::{
    unix_now_ms, Inventory, Job, MinerInfo, PerformanceMetrics, Position, RebalanceHistoryEntry,
    Round,
};
use crate::engine::{score_pol_strategy, Backtester, ScoreParams, SwapEventSource};
use crate::executor::{ExecutionRequest, StrategyExecutor};
use crate::peers::synapse::{RebalanceQuery, RebalanceResponse};
use crate::peers::gateway::PeerReply;
use crate::peers::MinerQueryGateway;
use crate::protocols::uniswap_v3::{total_deployed_amounts, u256_to_f64};
use crate::storage::RebalanceDecision;
use crate::utils::error::compact_error_message;
use serde::Serialize;
use std::time::Duration;

pub const REBALANCE_TOLERANCE: f64 = 0.02;
pub const EVALUATION_BATCH_SIZE: usize = 50;
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(1);

const TIMEOUT_REFUSAL_REASON: &str = "Timeout or error";

/// `a == b`, or their relative difference is at most `tol`.
pub fn values_within_tolerance(a: f64, b: f64, tol: f64) -> bool {
    if a == b {
        return true;
    }
    let denom = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() / denom <= tol
}

fn sorted_by_range(positions: &[Position]) -> Vec<&Position> {
    let mut refs: Vec<&Position> = positions.iter().collect();
    refs.sort_by_key(|p| (p.range_key(), p.allocation0, p.allocation1));
    refs
}

/// True when `proposed` is close enough to `current` that rebalancing would only chase drift.
/// Positions pair up by range after sorting, so repeated ranges compare one to one.
pub fn positions_within_tolerance(current: &[Position], proposed: &[Position], tol: f64) -> bool {
    if current.len() != proposed.len() {
        return false;
    }
    sorted_by_range(current)
        .into_iter()
        .zip(sorted_by_range(proposed))
        .all(|(have, want)| {
            have.range_key() == want.range_key()
                && values_within_tolerance(
                    u256_to_f64(have.allocation0),
                    u256_to_f64(want.allocation0),
                    tol,
                )
                && values_within_tolerance(
                    u256_to_f64(have.allocation1),
                    u256_to_f64(want.allocation1),
                    tol,
                )
        })
}

/// Check blocks sit at `start + k * interval`. A block that skips past one still triggers it,
/// and a block never triggers twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSchedule {
    start_block: u64,
    interval: u64,
    next_check: u64,
}

impl CheckSchedule {
    pub fn new(start_block: u64, interval: u64) -> Self {
        Self {
            start_block,
            interval: interval.max(1),
            next_check: start_block,
        }
    }

    pub fn is_due(&self, block: u64) -> bool {
        block >= self.next_check
    }

    pub fn mark_checked(&mut self, block: u64) {
        let elapsed = block.saturating_sub(self.start_block);
        let k = elapsed / self.interval + 1;
        self.next_check = self
            .start_block
            .saturating_add(k.saturating_mul(self.interval));
    }

    pub fn next_check(&self) -> u64 {
        self.next_check
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Active,
    Refused,
    TimedOut,
    Completed,
    /// Finished the loop but could not be backtested.
    Unscored,
}

impl LoopStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LoopStatus::Active)
    }
}

/// What a miner's reply means for its state at one check block.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    NoReply,
    Refused(Option<String>),
    /// Accepted, but nothing to change: no positions proposed, or within tolerance.
    Hold,
    /// Accepted, but the proposal cannot be deployed from the round's inventory.
    Invalid(String),
    Rebalance {
        positions: Vec<Position>,
        inventory: Inventory,
    },
}

/// Deployment validation against the round's starting inventory at `price`.
pub fn validate_proposal(
    initial_inventory: &Inventory,
    positions: &[Position],
    price: f64,
) -> Result<Inventory, String> {
    if let Some(bad) = positions.iter().find(|p| !p.is_well_formed()) {
        return Err(format!(
            "malformed range [{}, {})",
            bad.tick_lower, bad.tick_upper
        ));
    }
    let (used0, used1) = total_deployed_amounts(positions, price);
    initial_inventory
        .remaining_after(used0, used1)
        .ok_or_else(|| format!("insufficient inventory: needs ({used0}, {used1})"))
}

/// One miner's state over a round.
#[derive(Debug, Clone)]
pub struct MinerSimulation {
    pub miner: MinerInfo,
    pub status: LoopStatus,
    pub initial_inventory: Inventory,
    pub positions: Vec<Position>,
    pub inventory: Inventory,
    pub history: Vec<RebalanceHistoryEntry>,
    pub rebalances: u32,
    pub refusal_reason: Option<String>,
    pub response_time_ms: u64,
    pub execution_failures: u32,
}

impl MinerSimulation {
    pub fn new(
        miner: MinerInfo,
        start_block: u64,
        initial_positions: Vec<Position>,
        initial_inventory: Inventory,
    ) -> Self {
        Self {
            miner,
            status: LoopStatus::Active,
            initial_inventory,
            positions: initial_positions.clone(),
            inventory: initial_inventory,
            history: vec![RebalanceHistoryEntry::seed(
                start_block,
                initial_positions,
                initial_inventory,
            )],
            rebalances: 0,
            refusal_reason: None,
            response_time_ms: 0,
            execution_failures: 0,
        }
    }

    pub fn query(&self, job: &Job, round: &Round, block: u64, price: f64, tick_spacing: i32) -> RebalanceQuery {
        RebalanceQuery {
            job_id: job.job_id.clone(),
            sn_liquidity_manager_address: job.sn_liquidity_manager_address,
            pair_address: job.pair_address,
            chain_id: job.chain_id,
            round_id: round.round_id.clone(),
            round_type: round.round_type,
            block_number: block,
            current_price: price,
            current_positions: self.positions.clone(),
            inventory_remaining: self.inventory,
            rebalances_so_far: self.rebalances,
            tick_spacing,
        }
    }

    pub fn decide(&self, reply: Option<&RebalanceResponse>, price: f64) -> StepDecision {
        let Some(reply) = reply else {
            return StepDecision::NoReply;
        };
        if !reply.accepted {
            return StepDecision::Refused(reply.refusal_reason.clone());
        }
        let Some(proposed) = reply.desired_positions.as_deref() else {
            return StepDecision::Hold;
        };
        if positions_within_tolerance(&self.positions, proposed, REBALANCE_TOLERANCE) {
            return StepDecision::Hold;
        }
        match validate_proposal(&self.initial_inventory, proposed, price) {
            Ok(inventory) => StepDecision::Rebalance {
                positions: proposed.to_vec(),
                inventory,
            },
            Err(reason) => StepDecision::Invalid(reason),
        }
    }

    /// Appends a history entry and makes `positions` the deployed set.
    pub fn commit(
        &mut self,
        block: u64,
        price: f64,
        price_in_query: f64,
        positions: Vec<Position>,
        inventory: Inventory,
        execution: Option<(Option<i64>, Option<String>)>,
    ) {
        let (execution_id, tx_hash) = execution.unwrap_or((None, None));
        let old_positions = std::mem::replace(&mut self.positions, positions.clone());
        self.inventory = inventory;
        self.history.push(RebalanceHistoryEntry {
            block,
            price: Some(price),
            price_in_query: Some(price_in_query),
            old_positions,
            new_positions: positions,
            inventory,
            execution_id,
            tx_hash,
        });
        self.rebalances = self.rebalances.saturating_add(1);
    }

    /// Evaluation semantics: a missing reply or a refusal ends this miner's round.
    pub fn apply_evaluation_step(
        &mut self,
        reply: Option<&RebalanceResponse>,
        block: u64,
        price_in_query: f64,
        price: f64,
    ) {
        if self.status.is_terminal() {
            return;
        }
        match self.decide(reply, price) {
            StepDecision::NoReply => {
                tracing::warn!("[EVAL] miner {} timeout/error at block {}", self.miner.uid, block);
                self.status = LoopStatus::TimedOut;
                self.refusal_reason = Some(TIMEOUT_REFUSAL_REASON.to_string());
            }
            StepDecision::Refused(reason) => {
                tracing::info!(
                    "[EVAL] miner {} refused at block {}: {}",
                    self.miner.uid,
                    block,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.status = LoopStatus::Refused;
                self.refusal_reason = reason;
            }
            StepDecision::Hold => {}
            StepDecision::Invalid(reason) => {
                tracing::debug!(
                    "[EVAL] miner {} proposal rejected at block {}: {}",
                    self.miner.uid,
                    block,
                    reason
                );
            }
            StepDecision::Rebalance {
                positions,
                inventory,
            } => {
                tracing::debug!(
                    "[EVAL] miner {} rebalancing at block {}: {} position(s)",
                    self.miner.uid,
                    block,
                    positions.len()
                );
                self.commit(block, price, price_in_query, positions, inventory, None);
            }
        }
    }

    pub fn finish(&mut self) {
        if self.status == LoopStatus::Active {
            self.status = LoopStatus::Completed;
        }
    }

    /// Withdraws acceptance from a miner whose run could not be scored.
    pub fn mark_unscored(&mut self, reason: String) {
        self.status = LoopStatus::Unscored;
        self.refusal_reason = Some(reason);
    }

    pub fn accepted(&self) -> bool {
        self.status == LoopStatus::Completed
    }

    pub fn decision(&self, round: &Round) -> RebalanceDecision {
        RebalanceDecision {
            round_id: round.round_id.clone(),
            job_id: round.job_id.clone(),
            miner_uid: self.miner.uid,
            miner_hotkey: self.miner.hotkey.clone(),
            accepted: self.accepted(),
            rebalance_history: Some(self.history.clone()),
            refusal_reason: self.refusal_reason.clone(),
            response_time_ms: self.response_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub block: u64,
    pub success: bool,
    pub execution_id: Option<i64>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Shared inputs of a round loop.
pub struct LoopContext<'a> {
    pub job: &'a Job,
    pub round: &'a Round,
    pub chain: &'a dyn ChainClient,
    pub gateway: &'a MinerQueryGateway,
    pub tick_spacing: i32,
    pub check_interval: u64,
    pub idle_poll: Duration,
}

impl LoopContext<'_> {
    fn deadline_passed(&self) -> bool {
        self.round.deadline_passed(unix_now_ms())
    }

    async fn price(&self) -> Option<f64> {
        match self.chain.current_price(&self.job.pool_ref()).await {
            Ok(price) => Some(price),
            Err(err) => {
                tracing::warn!(
                    "[ROUND] {} price read failed: {}",
                    self.round.round_id,
                    compact_error_message(&err.to_string(), 200)
                );
                None
            }
        }
    }

    /// Latest block, or `previous` when the chain read fails.
    async fn refresh_block(&self, previous: u64) -> u64 {
        match self.chain.block_number(self.job.chain_id).await {
            Ok(block) => block.max(previous),
            Err(err) => {
                tracing::warn!(
                    "[ROUND] {} block refresh failed: {}",
                    self.round.round_id,
                    compact_error_message(&err.to_string(), 200)
                );
                previous
            }
        }
    }
}

/// Drives all miners of an evaluation round through one shared block loop. Returns the
/// simulations, all terminal, and the last observed block.
pub async fn run_evaluation_batch(
    ctx: &LoopContext<'_>,
    miners: Vec<MinerInfo>,
    initial_positions: &[Position],
    initial_inventory: Inventory,
) -> (Vec<MinerSimulation>, u64) {
    let start_block = ctx.round.start_block;
    let mut sims: Vec<MinerSimulation> = miners
        .into_iter()
        .map(|miner| {
            MinerSimulation::new(miner, start_block, initial_positions.to_vec(), initial_inventory)
        })
        .collect();
    let mut schedule = CheckSchedule::new(start_block, ctx.check_interval);
    let mut block = start_block;

    while !ctx.deadline_passed() {
        if !sims.iter().any(|s| s.status == LoopStatus::Active) {
            break;
        }
        if !schedule.is_due(block) {
            tokio::time::sleep(ctx.idle_poll).await;
            block = ctx.refresh_block(block).await;
            continue;
        }
        let Some(price_in_query) = ctx.price().await else {
            tokio::time::sleep(ctx.idle_poll).await;
            block = ctx.refresh_block(block).await;
            continue;
        };
        schedule.mark_checked(block);

        let active: Vec<usize> = sims
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == LoopStatus::Active)
            .map(|(idx, _)| idx)
            .collect();
        let mut replies: Vec<(usize, PeerReply)> = Vec::with_capacity(active.len());
        for chunk in active.chunks(EVALUATION_BATCH_SIZE) {
            let requests = chunk
                .iter()
                .map(|&idx| {
                    let sim = &sims[idx];
                    (
                        sim.miner.clone(),
                        sim.query(ctx.job, ctx.round, block, price_in_query, ctx.tick_spacing),
                    )
                })
                .collect();
            let chunk_replies = ctx.gateway.query_many(requests).await;
            replies.extend(chunk.iter().copied().zip(chunk_replies));
        }

        let price = ctx.price().await.unwrap_or(price_in_query);
        for (idx, reply) in replies {
            let sim = &mut sims[idx];
            sim.response_time_ms = sim.response_time_ms.saturating_add(reply.elapsed_ms);
            sim.apply_evaluation_step(reply.response.as_ref(), block, price_in_query, price);
        }
        tracing::debug!(
            "[EVAL] {} block {}: {} active miner(s), next check {}",
            ctx.round.round_id,
            block,
            sims.iter().filter(|s| s.status == LoopStatus::Active).count(),
            schedule.next_check()
        );
        block = ctx.refresh_block(block).await;
    }

    for sim in &mut sims {
        sim.finish();
    }
    (sims, block)
}

#[derive(Debug, Clone)]
pub struct LiveLoopOutcome {
    pub simulation: MinerSimulation,
    pub end_block: u64,
    pub executions: Vec<ExecutionRecord>,
}

impl LiveLoopOutcome {
    /// At least one execution was attempted and none succeeded.
    pub fn all_executions_failed(&self) -> bool {
        !self.executions.is_empty() && self.executions.iter().all(|e| !e.success)
    }
}

/// Runs the single promoted miner. Missing replies and refusals skip the step; accepted
/// proposals are committed only after the executor reports success.
pub async fn run_live_loop(
    ctx: &LoopContext<'_>,
    miner: MinerInfo,
    initial_positions: &[Position],
    initial_inventory: Inventory,
    executor: &dyn StrategyExecutor,
) -> LiveLoopOutcome {
    let start_block = ctx.round.start_block;
    let mut sim = MinerSimulation::new(
        miner,
        start_block,
        initial_positions.to_vec(),
        initial_inventory,
    );
    let mut schedule = CheckSchedule::new(start_block, ctx.check_interval);
    let mut executions = Vec::new();
    let mut block = start_block;

    while !ctx.deadline_passed() {
        if !schedule.is_due(block) {
            tokio::time::sleep(ctx.idle_poll).await;
            block = ctx.refresh_block(block).await;
            continue;
        }
        let Some(price_in_query) = ctx.price().await else {
            tokio::time::sleep(ctx.idle_poll).await;
            block = ctx.refresh_block(block).await;
            continue;
        };
        schedule.mark_checked(block);

        let request = sim.query(ctx.job, ctx.round, block, price_in_query, ctx.tick_spacing);
        let reply = ctx.gateway.query_one(sim.miner.clone(), request).await;
        sim.response_time_ms = sim.response_time_ms.saturating_add(reply.elapsed_ms);

        match sim.decide(reply.response.as_ref(), price_in_query) {
            StepDecision::NoReply => {
                tracing::warn!("[LIVE] miner {} no reply at block {}", sim.miner.uid, block);
            }
            StepDecision::Refused(reason) => {
                tracing::info!(
                    "[LIVE] miner {} declined at block {}: {}",
                    sim.miner.uid,
                    block,
                    reason.as_deref().unwrap_or("no reason")
                );
            }
            StepDecision::Hold => {}
            StepDecision::Invalid(reason) => {
                tracing::warn!(
                    "[LIVE] miner {} proposal rejected at block {}: {}",
                    sim.miner.uid,
                    block,
                    reason
                );
            }
            StepDecision::Rebalance { positions, .. } => {
                let request = ExecutionRequest {
                    job_id: ctx.job.job_id.clone(),
                    sn_liquidity_manager_address: ctx.job.sn_liquidity_manager_address,
                    pair_address: ctx.job.pair_address,
                    positions: positions.clone(),
                    round_id: ctx.round.round_id.clone(),
                    miner_uid: sim.miner.uid,
                };
                let result = executor.execute_strategy(&request).await;
                executions.push(ExecutionRecord {
                    block,
                    success: result.success,
                    execution_id: result.execution_id,
                    tx_hash: result.tx_hash.clone(),
                    error: result.error.clone(),
                });
                if result.success {
                    let price = ctx.price().await.unwrap_or(price_in_query);
                    // Executed on chain; clamp at zero if the price moved since validation.
                    let (used0, used1) = total_deployed_amounts(&positions, price);
                    let inventory = Inventory::new(
                        sim.initial_inventory.amount0.saturating_sub(used0),
                        sim.initial_inventory.amount1.saturating_sub(used1),
                    );
                    sim.commit(
                        block,
                        price,
                        price_in_query,
                        positions,
                        inventory,
                        Some((result.execution_id, result.tx_hash)),
                    );
                } else {
                    sim.execution_failures = sim.execution_failures.saturating_add(1);
                    tracing::error!(
                        "[LIVE] execution failed for miner {} at block {}: {}",
                        sim.miner.uid,
                        block,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        block = ctx.refresh_block(block).await;
    }

    sim.finish();
    LiveLoopOutcome {
        simulation: sim,
        end_block: block,
        executions,
    }
}

/// Backtests a finished simulation and scores it.
pub async fn score_simulation<S: SwapEventSource>(
    backtester: &Backtester<S>,
    job: &Job,
    sim: &MinerSimulation,
    start_block: u64,
    end_block: u64,
    params: ScoreParams,
) -> crate::error::Result<(PerformanceMetrics, f64)> {
    let metrics = backtester
        .evaluate_positions_performance(
            job.pair_address,
            &sim.history,
            start_block,
            end_block,
            sim.initial_inventory,
            job.fee_rate,
        )
        .await?;
    let score = score_pol_strategy(&metrics, params);
    Ok((metrics, score))
}
