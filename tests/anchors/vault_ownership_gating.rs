//! Anchor Test: vault ownership is proven by `associatedMiner()` and only verified vaults holding
//! the minimum balance unlock participation.

use crate::anchor_utils::{e18, job, miner, temp_db, ScriptedChain, ScriptedPeers, CHAIN_ID};
use alloy::primitives::{Address, B256};
use sn98_validator::core::{unix_now_ms, Inventory};
use sn98_validator::storage::{ValidatorDb, VaultSnapshot};
use sn98_validator::vault::{VaultService, DEFAULT_PERFORMANCE_LOOKBACK};
use std::sync::Arc;
use std::time::Duration;

const MINIMUM_USD: f64 = 1_000.0;

fn owned_chain(owner_uid: u16, balance_tokens: u64) -> Arc<ScriptedChain> {
    let mut chain = ScriptedChain::new(5_000, Inventory::default());
    let hotkey = hex::decode(miner(owner_uid).hotkey).expect("hex hotkey");
    chain.associated_miner = B256::from_slice(&hotkey);
    chain.vault_balances = (e18(balance_tokens), e18(balance_tokens));
    Arc::new(chain)
}

fn service(db: &Arc<ValidatorDb>, chain: Arc<ScriptedChain>) -> VaultService {
    VaultService::new(db.clone(), chain, None, MINIMUM_USD)
}

#[tokio::test]
async fn test_associated_miner_mismatch_is_not_verified() {
    let db = temp_db("anchor_vault_mismatch");
    let vaults = service(&db, owned_chain(1, 600));
    let stranger = Address::repeat_byte(0x42);

    let vault = vaults
        .register_miner_vault(2, &miner(2).hotkey, stranger, CHAIN_ID, true)
        .await
        .expect("register vault");
    assert!(!vault.is_verified);
    let stored = db
        .vault_for_miner_sync(2)
        .expect("read vault")
        .expect("vault row");
    assert!(!stored.is_verified);

    assert!(vaults.check_vault_balance(&stored, job("j", 1).pair_address).await.is_some());
    assert!(!vaults.is_eligible(2).await, "unverified vaults never gate in");
}

#[tokio::test]
async fn test_verified_vault_needs_minimum_balance() {
    let db = temp_db("anchor_vault_balance");
    let vaults = service(&db, owned_chain(1, 600));
    let owned = Address::repeat_byte(0x41);

    let vault = vaults
        .register_miner_vault(1, &miner(1).hotkey, owned, CHAIN_ID, true)
        .await
        .expect("register vault");
    assert!(vault.is_verified);
    assert!(!vaults.is_eligible(1).await, "no snapshot yet");

    let snapshot = vaults
        .check_vault_balance(&vault, job("j", 1).pair_address)
        .await
        .expect("snapshot");
    // Unit prices without a feed: 600 + 600 tokens.
    assert!((snapshot.total_value_usd - 1_200.0).abs() < 1e-6);
    assert!(vaults.is_eligible(1).await);
    assert_eq!(vaults.filter_eligible(&[1, 2, 3]).await, vec![1]);

    let poor_db = temp_db("anchor_vault_poor");
    let poor = service(&poor_db, owned_chain(1, 10));
    let vault = poor
        .register_miner_vault(1, &miner(1).hotkey, owned, CHAIN_ID, true)
        .await
        .expect("register vault");
    poor.check_vault_balance(&vault, job("j", 1).pair_address)
        .await
        .expect("snapshot");
    assert!(!poor.is_eligible(1).await);
}

#[tokio::test]
async fn test_sync_registers_reported_vaults_and_snapshots_verified_ones() {
    let db = temp_db("anchor_vault_sync");
    let vaults = service(&db, owned_chain(1, 600));
    let peers = Arc::new(
        ScriptedPeers::default()
            .with_vault(1, Address::repeat_byte(0x51))
            .with_vault(2, Address::repeat_byte(0x52)),
    );

    vaults
        .sync_miner_vaults(
            &[miner(1), miner(2), miner(3)],
            peers,
            Duration::from_millis(100),
            &[job("job-sync", 60)],
        )
        .await
        .expect("vault sync");

    let first = db
        .vault_for_miner_sync(1)
        .expect("read vault")
        .expect("vault row");
    assert!(first.is_verified);
    assert!(vaults.is_eligible(1).await);

    let second = db
        .vault_for_miner_sync(2)
        .expect("read vault")
        .expect("vault row");
    assert!(!second.is_verified);
    assert!(db.vault_for_miner_sync(3).expect("read vault").is_none());
}

#[tokio::test]
async fn test_performance_compares_against_the_snapshot_before_lookback() {
    let db = temp_db("anchor_vault_performance");
    let vaults = service(&db, owned_chain(1, 600));
    let owned = Address::repeat_byte(0x43);
    let day = DEFAULT_PERFORMANCE_LOOKBACK;
    assert_eq!(vaults.vault_performance_score(owned, day).await, 0.0);

    let vault = vaults
        .register_miner_vault(1, &miner(1).hotkey, owned, CHAIN_ID, true)
        .await
        .expect("register vault");
    vaults
        .check_vault_balance(&vault, job("j", 1).pair_address)
        .await
        .expect("snapshot");
    // Only a fresh snapshot: nothing old enough to compare against.
    assert_eq!(vaults.vault_performance_score(owned, day).await, 0.0);

    let two_days_ago = unix_now_ms() - 2 * 86_400_000;
    db.record_vault_snapshot_sync(&VaultSnapshot {
        vault_address: owned,
        token0_balance: e18(400),
        token1_balance: e18(400),
        total_value_usd: 800.0,
        block_number: 10,
        timestamp_ms: two_days_ago,
    })
    .expect("old snapshot");
    let change = vaults.vault_performance_score(owned, day).await;
    assert!((change - 0.5).abs() < 1e-9, "1200 vs 800 is +50%, got {change}");
}
