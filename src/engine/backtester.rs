//! Replays historical swaps against a rebalance history to measure how a strategy would have
//! performed.
//!
//! Each swap pays the pool fee on its input token. The simulated positions earn the slice of that
//! fee matching their share of the in-range liquidity at the swap price. At the close, deployed
//! capital plus idle inventory is valued against simply holding the initial inventory.

use crate::core::{Inventory, PerformanceMetrics, Position, RebalanceHistoryEntry};
use crate::error::{BacktestError, Result};
use crate::protocols::uniswap_v3::{
    f64_to_u256_floor, position_liquidity_and_amounts, sqrt_price_x96_to_price, tick_to_price,
    total_deployed_amounts, u256_to_f64,
};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub block_number: u64,
    pub log_index: u64,
    #[serde(with = "crate::core::decimal_u256")]
    pub sqrt_price_x96: U256,
    pub tick: i32,
    /// Signed pool-side delta: positive means the token flowed into the pool.
    pub amount0: f64,
    pub amount1: f64,
    /// Active pool liquidity after the swap. Some indexers leave it empty.
    pub liquidity: Option<f64>,
}

impl SwapEvent {
    pub fn price(&self) -> f64 {
        sqrt_price_x96_to_price(self.sqrt_price_x96)
    }
}

/// Historical swap data for a pool.
#[async_trait]
pub trait SwapEventSource: Send + Sync {
    /// Swaps in `[start_block, end_block]`, ordered by block then log index.
    async fn swap_events(
        &self,
        pool: Address,
        start_block: u64,
        end_block: u64,
    ) -> anyhow::Result<Vec<SwapEvent>>;

    /// Price implied by the latest swap at or before `block`.
    async fn price_at_block(&self, pool: Address, block: u64) -> anyhow::Result<Option<f64>>;
}

#[async_trait]
impl<T: SwapEventSource + ?Sized> SwapEventSource for std::sync::Arc<T> {
    async fn swap_events(
        &self,
        pool: Address,
        start_block: u64,
        end_block: u64,
    ) -> anyhow::Result<Vec<SwapEvent>> {
        (**self).swap_events(pool, start_block, end_block).await
    }

    async fn price_at_block(&self, pool: Address, block: u64) -> anyhow::Result<Option<f64>> {
        (**self).price_at_block(pool, block).await
    }
}

pub struct Backtester<S> {
    source: S,
}

impl<S: SwapEventSource> Backtester<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn evaluate_positions_performance(
        &self,
        pool: Address,
        rebalance_history: &[RebalanceHistoryEntry],
        start_block: u64,
        end_block: u64,
        initial_inventory: Inventory,
        fee_rate: f64,
    ) -> Result<PerformanceMetrics> {
        let events = self
            .source
            .swap_events(pool, start_block, end_block)
            .await
            .map_err(|e| BacktestError::DataSource(format!("{e:#}")))?;
        let final_price = self
            .source
            .price_at_block(pool, end_block)
            .await
            .map_err(|e| BacktestError::DataSource(format!("{e:#}")))?
            .ok_or(BacktestError::MissingPrice { block: end_block })?;

        let metrics = simulate(
            rebalance_history,
            &events,
            initial_inventory,
            fee_rate,
            final_price,
        )?;
        tracing::debug!(
            "[BACKTEST] pool={:#x} blocks={}..{} swaps={} fees={:.6} il={:.6} in_range={:.4}",
            pool,
            start_block,
            end_block,
            metrics.swap_count,
            metrics.fees_collected,
            metrics.impermanent_loss,
            metrics.in_range_ratio
        );
        Ok(metrics)
    }
}

/// History ordered newest first, resolving what was deployed at a given block.
struct DeploymentTimeline<'a> {
    newest_first: Vec<&'a RebalanceHistoryEntry>,
}

impl<'a> DeploymentTimeline<'a> {
    fn new(history: &'a [RebalanceHistoryEntry]) -> Self {
        let mut newest_first: Vec<&RebalanceHistoryEntry> = history.iter().collect();
        newest_first.sort_by(|a, b| b.block.cmp(&a.block));
        Self { newest_first }
    }

    fn deployed_at(&self, block: u64) -> std::result::Result<&'a [Position], BacktestError> {
        self.newest_first
            .iter()
            .find(|entry| block > entry.block)
            .map(|entry| entry.new_positions.as_slice())
            .ok_or(BacktestError::InvalidRebalanceHistory { block })
    }

    fn latest(&self) -> Option<&'a RebalanceHistoryEntry> {
        self.newest_first.first().copied()
    }
}

/// Fee share of the simulated liquidity, counting it as added on top of the reported pool depth.
pub fn liquidity_share(simulated_in_range_liquidity: f64, event: &SwapEvent) -> Result<f64> {
    let reported = event.liquidity.ok_or(BacktestError::MissingPoolLiquidity {
        block: event.block_number,
        log_index: event.log_index,
    })?;
    let total = reported + simulated_in_range_liquidity;
    if !(total > 0.0) {
        tracing::warn!(
            "[BACKTEST] non-positive pool liquidity {} at block {}; share forced to 0",
            total,
            event.block_number
        );
        return Ok(0.0);
    }
    Ok((simulated_in_range_liquidity / total).min(1.0))
}

/// Core replay over already-loaded swaps. `final_price` values everything at the close.
pub fn simulate(
    rebalance_history: &[RebalanceHistoryEntry],
    events: &[SwapEvent],
    initial_inventory: Inventory,
    fee_rate: f64,
    final_price: f64,
) -> Result<PerformanceMetrics> {
    let timeline = DeploymentTimeline::new(rebalance_history);

    let mut fees0 = 0.0f64;
    let mut fees1 = 0.0f64;
    let mut in_range_events = 0u64;

    for event in events {
        let price = event.price();
        let positions = timeline.deployed_at(event.block_number)?;

        let mut in_range_liquidity = 0.0f64;
        let mut any_in_range = false;
        for position in positions {
            let lower = tick_to_price(position.tick_lower);
            let upper = tick_to_price(position.tick_upper);
            if lower <= price && price <= upper {
                any_in_range = true;
                let (liquidity, _, _) = position_liquidity_and_amounts(position, price);
                in_range_liquidity += liquidity;
            }
        }
        if any_in_range {
            in_range_events += 1;
        }

        let share = liquidity_share(in_range_liquidity, event)?;
        if event.amount0 > 0.0 {
            fees0 += event.amount0 * fee_rate * share;
        } else if event.amount1 > 0.0 {
            fees1 += event.amount1 * fee_rate * share;
        }
    }

    let latest = timeline
        .latest()
        .ok_or(BacktestError::InvalidRebalanceHistory { block: 0 })?;
    let (amount0_deployed, amount1_deployed) =
        total_deployed_amounts(&latest.new_positions, final_price);
    let idle = latest.inventory;
    let amount0_holdings = amount0_deployed.saturating_add(idle.amount0);
    let amount1_holdings = amount1_deployed.saturating_add(idle.amount1);

    let hodl_value = u256_to_f64(initial_inventory.amount0) * final_price
        + u256_to_f64(initial_inventory.amount1);
    let lp_value = u256_to_f64(amount0_holdings) * final_price + u256_to_f64(amount1_holdings);
    let impermanent_loss = if hodl_value > 0.0 {
        ((hodl_value - lp_value) / hodl_value).max(0.0)
    } else {
        0.0
    };

    let swap_count = events.len() as u64;
    let in_range_ratio = if swap_count > 0 {
        in_range_events as f64 / swap_count as f64
    } else {
        0.0
    };
    let fees_collected = fees0 * final_price + fees1;

    let final_inventory = Inventory::new(
        amount0_holdings.saturating_add(f64_to_u256_floor(fees0)),
        amount1_holdings.saturating_add(f64_to_u256_floor(fees1)),
    );

    Ok(PerformanceMetrics {
        fees_collected,
        fees0,
        fees1,
        impermanent_loss,
        in_range_ratio,
        amount0_deployed,
        amount1_deployed,
        amount0_holdings,
        amount1_holdings,
        initial_value: hodl_value,
        final_value: lp_value + fees_collected,
        initial_inventory,
        final_inventory,
        final_price,
        swap_count,
    })
}
