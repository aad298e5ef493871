//! Domain types shared by the engine, the round loops and the storage layer.
//!
//! Token amounts are raw integer units (`U256`) and travel over the wire and into storage as
//! decimal strings.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod decimal_u256;

/// Minimum tenure before a miner can be promoted to a live round.
pub const MIN_LIVE_PARTICIPATION_DAYS: u64 = 7;
pub const MS_PER_DAY: u64 = 86_400_000;

static LAST_NOW_MS: AtomicU64 = AtomicU64::new(1);

/// Wall-clock milliseconds, never moving backwards within the process.
pub fn unix_now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64);
    let mut prev = LAST_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample.unwrap_or(prev).max(prev).max(1);
        match LAST_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub tick_lower: i32,
    pub tick_upper: i32,
    #[serde(with = "decimal_u256")]
    pub allocation0: U256,
    #[serde(with = "decimal_u256")]
    pub allocation1: U256,
}

impl Position {
    pub fn new(tick_lower: i32, tick_upper: i32, allocation0: U256, allocation1: U256) -> Self {
        Self {
            tick_lower,
            tick_upper,
            allocation0,
            allocation1,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.tick_lower < self.tick_upper
    }

    pub fn range_key(&self) -> (i32, i32) {
        (self.tick_lower, self.tick_upper)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(with = "decimal_u256")]
    pub amount0: U256,
    #[serde(with = "decimal_u256")]
    pub amount1: U256,
}

impl Inventory {
    pub fn new(amount0: U256, amount1: U256) -> Self {
        Self { amount0, amount1 }
    }

    /// Inventory left after deploying `(used0, used1)`, or `None` if either side would go negative.
    pub fn remaining_after(&self, used0: U256, used1: U256) -> Option<Self> {
        Some(Self {
            amount0: self.amount0.checked_sub(used0)?,
            amount1: self.amount1.checked_sub(used1)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundType {
    Evaluation,
    Live,
}

impl RoundType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundType::Evaluation => "evaluation",
            RoundType::Live => "live",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "evaluation" => Some(Self::Evaluation),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Active,
    Completed,
}

impl RoundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Active => "active",
            RoundStatus::Completed => "completed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// On-chain location of the pool a job manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRef {
    pub chain_id: u64,
    pub liquidity_manager: Address,
    pub pair: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub sn_liquidity_manager_address: Address,
    pub pair_address: Address,
    pub chain_id: u64,
    pub fee_rate: f64,
    pub round_duration_seconds: u64,
    pub is_active: bool,
}

impl Job {
    pub fn pool_ref(&self) -> PoolRef {
        PoolRef {
            chain_id: self.chain_id,
            liquidity_manager: self.sn_liquidity_manager_address,
            pair: self.pair_address,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub round_id: String,
    pub job_id: String,
    pub round_type: RoundType,
    pub round_number: u64,
    pub start_block: u64,
    pub deadline_ms: u64,
    pub status: RoundStatus,
    pub winner_uid: Option<u16>,
}

impl Round {
    pub fn make_id(job_id: &str, round_type: RoundType, round_number: u64) -> String {
        format!("{job_id}:{}:{round_number}", round_type.as_str())
    }

    pub fn deadline_passed(&self, now_ms: u64) -> bool {
        now_ms > self.deadline_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceHistoryEntry {
    pub block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_in_query: Option<f64>,
    #[serde(default)]
    pub old_positions: Vec<Position>,
    pub new_positions: Vec<Position>,
    pub inventory: Inventory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl RebalanceHistoryEntry {
    /// The entry describing what is deployed when a round starts.
    pub fn seed(start_block: u64, positions: Vec<Position>, inventory: Inventory) -> Self {
        Self {
            block: start_block.saturating_sub(1),
            price: None,
            price_in_query: None,
            old_positions: Vec::new(),
            new_positions: positions,
            inventory,
            execution_id: None,
            tx_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub fees_collected: f64,
    pub fees0: f64,
    pub fees1: f64,
    pub impermanent_loss: f64,
    pub in_range_ratio: f64,
    #[serde(with = "decimal_u256")]
    pub amount0_deployed: U256,
    #[serde(with = "decimal_u256")]
    pub amount1_deployed: U256,
    #[serde(with = "decimal_u256")]
    pub amount0_holdings: U256,
    #[serde(with = "decimal_u256")]
    pub amount1_holdings: U256,
    pub initial_value: f64,
    pub final_value: f64,
    pub initial_inventory: Inventory,
    pub final_inventory: Inventory,
    pub final_price: f64,
    pub swap_count: u64,
}

/// A peer known to the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerInfo {
    pub uid: u16,
    pub hotkey: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinerScore {
    pub job_id: String,
    pub miner_uid: u16,
    pub miner_hotkey: String,
    pub evaluation_score: f64,
    pub live_score: f64,
    pub combined_score: f64,
    pub participation_days: u64,
    pub first_participation_ms: Option<u64>,
    pub last_participation_ms: Option<u64>,
    pub total_rounds: u64,
    pub accepted_rounds: u64,
    pub is_eligible: bool,
}
