//! Anchor Test: proposals are validated against the round's starting inventory and rejected ones
//! leave the miner's state untouched without ending its round.

use crate::anchor_utils::{e18, miner, pos};
use alloy::primitives::U256;
use sn98_validator::core::{Inventory, Position};
use sn98_validator::peers::synapse::RebalanceResponse;
use sn98_validator::runtime::{LoopStatus, MinerSimulation};

fn accepted(positions: Vec<Position>) -> RebalanceResponse {
    RebalanceResponse {
        accepted: true,
        refusal_reason: None,
        desired_positions: Some(positions),
        miner_metadata: None,
    }
}

fn share(numerator: u64) -> U256 {
    // Tenths of one token.
    U256::from(numerator) * U256::from(100_000_000_000_000_000u64)
}

#[test]
fn test_over_allocation_is_rejected_and_the_loop_continues() {
    let initial = Inventory::new(e18(1), e18(1));
    let mut sim = MinerSimulation::new(miner(7), 500, Vec::new(), initial);

    sim.apply_evaluation_step(
        Some(&accepted(vec![pos(-600, 600, e18(3), e18(3))])),
        500,
        1.0,
        1.0,
    );
    assert_eq!(sim.status, LoopStatus::Active);
    assert!(sim.positions.is_empty());
    assert_eq!(sim.inventory, initial);
    assert_eq!(sim.rebalances, 0);

    let half = vec![pos(-600, 600, share(5), share(5))];
    sim.apply_evaluation_step(Some(&accepted(half.clone())), 510, 1.0, 1.0);
    assert_eq!(sim.positions, half);
    assert_eq!(sim.rebalances, 1);

    // Two ranges that each fit but together overdraw.
    let split = vec![
        pos(-600, 600, share(6), share(6)),
        pos(-1_200, 1_200, share(6), share(6)),
    ];
    sim.apply_evaluation_step(Some(&accepted(split)), 520, 1.0, 1.0);
    assert_eq!(sim.positions, half);
    assert_eq!(sim.rebalances, 1);

    // A replacement is measured against the starting inventory, not what is left of it.
    let larger = vec![pos(-600, 600, share(9), share(9))];
    sim.apply_evaluation_step(Some(&accepted(larger.clone())), 530, 1.0, 1.0);
    assert_eq!(sim.positions, larger);
    assert_eq!(sim.rebalances, 2);
    assert!(sim.inventory.amount0 <= initial.amount0);
    assert!(sim.inventory.amount1 <= initial.amount1);

    sim.finish();
    assert!(sim.accepted());
    let blocks: Vec<u64> = sim.history.iter().map(|h| h.block).collect();
    assert_eq!(blocks, vec![499, 510, 530]);
    assert_eq!(sim.history[2].old_positions, half);
}

#[test]
fn test_inverted_range_never_deploys() {
    let initial = Inventory::new(e18(1), e18(1));
    let mut sim = MinerSimulation::new(miner(8), 10, Vec::new(), initial);
    sim.apply_evaluation_step(
        Some(&accepted(vec![pos(600, 600, share(1), share(1))])),
        10,
        1.0,
        1.0,
    );
    assert_eq!(sim.status, LoopStatus::Active);
    assert!(sim.positions.is_empty());
    assert_eq!(sim.history.len(), 1);
}
