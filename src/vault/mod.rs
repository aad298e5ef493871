//! Miner-owned vault registration, ownership checks and balance gating.

pub mod ss58;

use crate::chain::{ChainClient, StashBalances};
use crate::core::{unix_now_ms, Job, MinerInfo};
use crate::peers::client::PeerClient;
use crate::peers::synapse::VaultRegistrationQuery;
use crate::price::TokenPriceFeed;
use crate::protocols::uniswap_v3::u256_to_f64;
use crate::storage::{MinerVault, VaultRepository, VaultSnapshot};
use crate::utils::error::compact_error_message;
use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MINIMUM_VAULT_BALANCE_USD: f64 = 1_000.0;
pub const DEFAULT_PERFORMANCE_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);
const TOKEN_UNIT: f64 = 1e18;

/// Normalizes a hotkey to the 32-byte hex form stored by `associatedMiner()`, without `0x`.
pub fn normalize_hotkey_to_bytes32(hotkey: &str) -> String {
    let raw = hotkey.strip_prefix("0x").unwrap_or(hotkey);
    let is_hex = !raw.is_empty() && raw.chars().all(|c| c.is_ascii_hexdigit());
    if raw.len() == 64 && is_hex {
        return raw.to_ascii_lowercase();
    }
    if let Ok(account) = ss58::ss58_to_account_id(raw) {
        return hex::encode(account);
    }
    if is_hex {
        if let Ok(bytes) = hex::decode(raw) {
            let mut padded = [0u8; 32];
            let n = bytes.len().min(32);
            padded[..n].copy_from_slice(&bytes[..n]);
            return hex::encode(padded);
        }
    }
    raw.to_ascii_lowercase()
}

/// USD value of two raw 18-decimal balances. Without both prices every token counts as $1.
pub fn vault_value_usd(balances: &StashBalances, prices: Option<(f64, f64)>) -> f64 {
    let amount0 = u256_to_f64(balances.balance0) / TOKEN_UNIT;
    let amount1 = u256_to_f64(balances.balance1) / TOKEN_UNIT;
    match prices {
        Some((price0, price1)) => amount0 * price0 + amount1 * price1,
        None => amount0 + amount1,
    }
}

/// Relative value change from `old` to `latest`, 0 when the old value is zero.
pub fn relative_change(old_usd: f64, latest_usd: f64) -> f64 {
    if old_usd == 0.0 || !old_usd.is_finite() || !latest_usd.is_finite() {
        return 0.0;
    }
    (latest_usd - old_usd) / old_usd
}

pub struct VaultService {
    repo: Arc<dyn VaultRepository>,
    chain: Arc<dyn ChainClient>,
    prices: Option<Arc<dyn TokenPriceFeed>>,
    default_minimum_usd: f64,
}

impl VaultService {
    pub fn new(
        repo: Arc<dyn VaultRepository>,
        chain: Arc<dyn ChainClient>,
        prices: Option<Arc<dyn TokenPriceFeed>>,
        default_minimum_usd: f64,
    ) -> Self {
        Self {
            repo,
            chain,
            prices,
            default_minimum_usd,
        }
    }

    pub async fn register_miner_vault(
        &self,
        miner_uid: u16,
        miner_hotkey: &str,
        vault_address: Address,
        chain_id: u64,
        auto_verify: bool,
    ) -> anyhow::Result<MinerVault> {
        let mut vault = MinerVault {
            miner_uid,
            miner_hotkey: miner_hotkey.to_string(),
            vault_address,
            chain_id,
            is_verified: false,
            is_active: true,
            minimum_balance_usd: self.default_minimum_usd,
            registered_at_ms: unix_now_ms(),
            verified_at_ms: None,
        };
        self.repo.register_vault(&vault).await?;

        if auto_verify {
            if self
                .verify_associated_miner(vault_address, miner_hotkey, chain_id)
                .await
            {
                let now = unix_now_ms();
                self.repo.mark_vault_verified(vault_address, now).await?;
                vault.is_verified = true;
                vault.verified_at_ms = Some(now);
                tracing::info!(
                    "[VAULT] auto-verified vault {:#x} for miner {}",
                    vault_address,
                    miner_uid
                );
            } else {
                tracing::warn!(
                    "[VAULT] could not verify associatedMiner of vault {:#x} for miner {}",
                    vault_address,
                    miner_uid
                );
            }
        }
        Ok(vault)
    }

    /// True when the vault's `associatedMiner()` equals the normalized hotkey. Any failure reads
    /// as unverified.
    pub async fn verify_associated_miner(
        &self,
        vault_address: Address,
        expected_hotkey: &str,
        chain_id: u64,
    ) -> bool {
        let associated = match self.chain.associated_miner(chain_id, vault_address).await {
            Ok(value) => hex::encode(value.as_slice()),
            Err(err) => {
                tracing::warn!(
                    "[VAULT] associatedMiner() failed for {:#x}: {}",
                    vault_address,
                    compact_error_message(&err.to_string(), 200)
                );
                return false;
            }
        };
        let expected = normalize_hotkey_to_bytes32(expected_hotkey);
        let matches = associated.eq_ignore_ascii_case(&expected);
        if !matches {
            tracing::warn!(
                "[VAULT] associatedMiner mismatch for {:#x}: expected {}, got {}",
                vault_address,
                expected,
                associated
            );
        }
        matches
    }

    async fn token_prices(&self, balances: &StashBalances, chain_id: u64) -> Option<(f64, f64)> {
        let feed = self.prices.as_ref()?;
        let prices = tokio::try_join!(
            feed.token_price_usd(balances.token0, chain_id),
            feed.token_price_usd(balances.token1, chain_id),
        );
        match prices {
            Ok(pair) => Some(pair),
            Err(err) => {
                tracing::warn!("[VAULT] token prices unavailable: {}", err);
                None
            }
        }
    }

    /// Reads the vault's stash for `pool`, values it and stores a snapshot.
    pub async fn check_vault_balance(
        &self,
        vault: &MinerVault,
        pool: Address,
    ) -> Option<VaultSnapshot> {
        let balances = match self
            .chain
            .vault_balances(vault.chain_id, vault.vault_address, pool)
            .await
        {
            Ok(balances) => balances,
            Err(err) => {
                tracing::warn!(
                    "[VAULT] balance read failed for {:#x}: {}",
                    vault.vault_address,
                    compact_error_message(&err.to_string(), 200)
                );
                return None;
            }
        };
        let prices = self.token_prices(&balances, vault.chain_id).await;
        let snapshot = VaultSnapshot {
            vault_address: vault.vault_address,
            token0_balance: balances.balance0,
            token1_balance: balances.balance1,
            total_value_usd: vault_value_usd(&balances, prices),
            block_number: balances.block_number,
            timestamp_ms: unix_now_ms(),
        };
        if let Err(err) = self.repo.record_vault_snapshot(&snapshot).await {
            tracing::warn!(
                "[VAULT] failed to save snapshot for {:#x}: {}",
                vault.vault_address,
                err
            );
            return None;
        }
        tracing::info!(
            "[VAULT] {:#x} balance token0={} token1={} value=${:.2}",
            vault.vault_address,
            snapshot.token0_balance,
            snapshot.token1_balance,
            snapshot.total_value_usd
        );
        Some(snapshot)
    }

    async fn eligibility(&self, miner_uid: u16) -> anyhow::Result<bool> {
        let Some(vault) = self.repo.vault_for_miner(miner_uid).await? else {
            return Ok(false);
        };
        if !vault.is_verified || !vault.is_active {
            return Ok(false);
        }
        let latest = self.repo.latest_vault_snapshot(vault.vault_address).await?;
        Ok(latest.is_some_and(|s| s.total_value_usd >= vault.minimum_balance_usd))
    }

    pub async fn is_eligible(&self, miner_uid: u16) -> bool {
        match self.eligibility(miner_uid).await {
            Ok(eligible) => eligible,
            Err(err) => {
                tracing::warn!("[VAULT] eligibility check failed for miner {}: {}", miner_uid, err);
                false
            }
        }
    }

    pub async fn filter_eligible(&self, miner_uids: &[u16]) -> Vec<u16> {
        let mut eligible = Vec::with_capacity(miner_uids.len());
        for &uid in miner_uids {
            if self.is_eligible(uid).await {
                eligible.push(uid);
            }
        }
        tracing::info!(
            "[VAULT] {} of {} miners have eligible vaults",
            eligible.len(),
            miner_uids.len()
        );
        eligible
    }

    pub async fn vault_performance_score(&self, vault_address: Address, lookback: Duration) -> f64 {
        let cutoff = unix_now_ms().saturating_sub(lookback.as_millis() as u64);
        let latest = self.repo.latest_vault_snapshot(vault_address).await;
        let old = self
            .repo
            .vault_snapshot_at_or_before(vault_address, cutoff)
            .await;
        match (latest, old) {
            (Ok(Some(latest)), Ok(Some(old))) => {
                relative_change(old.total_value_usd, latest.total_value_usd)
            }
            _ => 0.0,
        }
    }

    /// Asks every peer for its vault, registers new ones and snapshots verified vaults against
    /// the active jobs' pools.
    pub async fn sync_miner_vaults(
        &self,
        peers: &[MinerInfo],
        client: Arc<dyn PeerClient>,
        timeout: Duration,
        jobs: &[Job],
    ) -> anyhow::Result<()> {
        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers.iter().cloned() {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let request = VaultRegistrationQuery {
                    validator_hotkey: None,
                };
                let reply = client.query_vault(&peer, &request, timeout).await;
                (peer, reply)
            }));
        }

        let mut registered = 0usize;
        for handle in handles {
            let (peer, reply) = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::warn!("[VAULT] registration query task failed: {}", join_err);
                    continue;
                }
            };
            let Ok(Some(response)) = reply else {
                continue;
            };
            let Some(vault_address) = response.vault_address.filter(|_| response.has_vault) else {
                continue;
            };
            let existing = self.repo.vault_for_miner(peer.uid).await?;
            let unchanged = existing.as_ref().is_some_and(|v| {
                v.vault_address == vault_address && v.miner_hotkey == peer.hotkey && v.is_verified
            });
            if unchanged {
                continue;
            }
            self.register_miner_vault(peer.uid, &peer.hotkey, vault_address, response.chain_id, true)
                .await?;
            registered += 1;
        }

        let mut snapshots = 0usize;
        for vault in self.repo.verified_vaults().await? {
            for job in jobs.iter().filter(|j| j.chain_id == vault.chain_id) {
                if self.check_vault_balance(&vault, job.pair_address).await.is_some() {
                    snapshots += 1;
                    break;
                }
            }
        }
        tracing::info!(
            "[VAULT] sync: {} peer(s) queried, {} vault(s) registered, {} snapshot(s)",
            peers.len(),
            registered,
            snapshots
        );
        Ok(())
    }
}
