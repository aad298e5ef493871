//! Wire payloads exchanged with miners.

use crate::core::{Inventory, Position, RoundType};
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHAIN_ID: u64 = 8453;
pub const DEFAULT_TICK_SPACING: i32 = 200;

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

fn default_tick_spacing() -> i32 {
    DEFAULT_TICK_SPACING
}

fn default_accepted() -> bool {
    true
}

/// Snapshot of one miner's own simulation state, sent at every rebalance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceQuery {
    pub job_id: String,
    pub sn_liquidity_manager_address: Address,
    pub pair_address: Address,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub round_id: String,
    pub round_type: RoundType,
    pub block_number: u64,
    /// token1 per token0.
    pub current_price: f64,
    pub current_positions: Vec<Position>,
    pub inventory_remaining: Inventory,
    #[serde(default)]
    pub rebalances_so_far: u32,
    #[serde(default = "default_tick_spacing")]
    pub tick_spacing: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerMetadata {
    pub version: String,
    pub model_info: String,
}

/// A miner's answer. `desired_positions: None` keeps the current deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceResponse {
    #[serde(default = "default_accepted")]
    pub accepted: bool,
    #[serde(default)]
    pub refusal_reason: Option<String>,
    #[serde(default)]
    pub desired_positions: Option<Vec<Position>>,
    #[serde(default)]
    pub miner_metadata: Option<MinerMetadata>,
}

impl RebalanceResponse {
    /// Parses a raw reply. Replies without an explicit `accepted` flag are unusable.
    pub fn from_reply(value: serde_json::Value) -> Option<Self> {
        if !value.get("accepted").is_some_and(|flag| flag.is_boolean()) {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRegistrationQuery {
    pub validator_hotkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRegistrationResponse {
    #[serde(default)]
    pub has_vault: bool,
    #[serde(default)]
    pub vault_address: Option<Address>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}
