//! Persistence seams. The runtime only talks to these traits; `ValidatorDb` is the SQLite
//! implementation used by the binaries.

pub mod validator_db;

use crate::core::{Job, MinerScore, RebalanceHistoryEntry, Round, RoundType};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;

pub use validator_db::ValidatorDb;

/// Weight of the newest round in the running combined score.
pub const COMBINED_SCORE_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceDecision {
    pub round_id: String,
    pub job_id: String,
    pub miner_uid: u16,
    pub miner_hotkey: String,
    pub accepted: bool,
    pub rebalance_history: Option<Vec<RebalanceHistoryEntry>>,
    pub refusal_reason: Option<String>,
    pub response_time_ms: u64,
}

/// One round's outcome for one miner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub job_id: String,
    pub miner_uid: u16,
    pub miner_hotkey: String,
    pub round_type: RoundType,
    pub score: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLiveExecution {
    pub round_id: String,
    pub job_id: String,
    pub miner_uid: u16,
    pub strategy: serde_json::Value,
    pub tx_hash: Option<String>,
    /// Present when the attempt already failed; the row is then stored as failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveExecution {
    pub execution_id: i64,
    pub round_id: String,
    pub job_id: String,
    pub miner_uid: u16,
    pub strategy: serde_json::Value,
    pub tx_hash: Option<String>,
    pub tx_status: ExecutionStatus,
    pub error: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinerVault {
    pub miner_uid: u16,
    pub miner_hotkey: String,
    pub vault_address: Address,
    pub chain_id: u64,
    pub is_verified: bool,
    pub is_active: bool,
    pub minimum_balance_usd: f64,
    pub registered_at_ms: u64,
    pub verified_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VaultSnapshot {
    pub vault_address: Address,
    pub token0_balance: U256,
    pub token1_balance: U256,
    pub total_value_usd: f64,
    pub block_number: u64,
    pub timestamp_ms: u64,
}

/// Jobs, rounds, miner decisions, scores and live executions.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn active_jobs(&self) -> anyhow::Result<Vec<Job>>;

    async fn upsert_job(&self, job: &Job) -> anyhow::Result<()>;

    /// Highest round number persisted for `(job, type)`, 0 when none.
    async fn latest_round_number(&self, job_id: &str, round_type: RoundType)
        -> anyhow::Result<u64>;

    async fn create_round(&self, round: &Round) -> anyhow::Result<()>;

    /// Marks an active round completed. Completing twice is an error.
    async fn complete_round(
        &self,
        round_id: &str,
        winner_uid: Option<u16>,
        performance: &serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn round(&self, round_id: &str) -> anyhow::Result<Option<Round>>;

    async fn save_rebalance_decisions(&self, decisions: &[RebalanceDecision])
        -> anyhow::Result<()>;

    async fn rebalance_decision(
        &self,
        round_id: &str,
        miner_uid: u16,
    ) -> anyhow::Result<Option<RebalanceDecision>>;

    /// Applies scores and participation in one write per batch.
    async fn apply_score_updates(&self, updates: &[ScoreUpdate], now_ms: u64)
        -> anyhow::Result<()>;

    async fn miner_score(&self, job_id: &str, miner_uid: u16) -> anyhow::Result<Option<MinerScore>>;

    async fn historic_combined_scores(&self, job_id: &str) -> anyhow::Result<HashMap<u16, f64>>;

    /// Uids of the latest completed evaluation round, best score first.
    async fn latest_evaluation_ranking(&self, job_id: &str) -> anyhow::Result<Vec<u16>>;

    /// Miners with enough tenure for live rounds.
    async fn eligible_miners(&self, job_id: &str) -> anyhow::Result<Vec<MinerScore>>;

    async fn create_live_execution(&self, record: &NewLiveExecution) -> anyhow::Result<i64>;

    async fn live_execution(&self, execution_id: i64) -> anyhow::Result<Option<LiveExecution>>;
}

/// Miner vault registrations and balance snapshots.
#[async_trait]
pub trait VaultRepository: Send + Sync {
    /// Inserts or refreshes a registration. Re-registering keeps verification only when the
    /// address is unchanged.
    async fn register_vault(&self, vault: &MinerVault) -> anyhow::Result<()>;

    async fn mark_vault_verified(&self, vault_address: Address, at_ms: u64) -> anyhow::Result<()>;

    async fn deactivate_vault(&self, vault_address: Address) -> anyhow::Result<()>;

    async fn vault_for_miner(&self, miner_uid: u16) -> anyhow::Result<Option<MinerVault>>;

    async fn verified_vaults(&self) -> anyhow::Result<Vec<MinerVault>>;

    async fn record_vault_snapshot(&self, snapshot: &VaultSnapshot) -> anyhow::Result<()>;

    async fn latest_vault_snapshot(&self, vault_address: Address)
        -> anyhow::Result<Option<VaultSnapshot>>;

    /// Newest snapshot taken at or before `at_ms`.
    async fn vault_snapshot_at_or_before(
        &self,
        vault_address: Address,
        at_ms: u64,
    ) -> anyhow::Result<Option<VaultSnapshot>>;
}

/// Running aggregate used for tie-breaks. A non-finite round score leaves the aggregate as is.
pub fn blend_combined_score(previous: Option<f64>, latest: f64) -> f64 {
    if !latest.is_finite() {
        return previous.filter(|p| p.is_finite()).unwrap_or(0.0);
    }
    match previous {
        Some(prev) if prev.is_finite() => {
            (1.0 - COMBINED_SCORE_EMA_ALPHA) * prev + COMBINED_SCORE_EMA_ALPHA * latest
        }
        _ => latest,
    }
}
