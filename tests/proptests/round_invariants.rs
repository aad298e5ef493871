use alloy::primitives::U256;
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};
use sn98_validator::core::{Inventory, MinerInfo, Position};
use sn98_validator::peers::synapse::RebalanceResponse;
use sn98_validator::protocols::uniswap_v3::{tick_to_price, total_deployed_amounts};
use sn98_validator::runtime::round_loops::{
    positions_within_tolerance, values_within_tolerance, CheckSchedule,
};
use sn98_validator::runtime::{MinerSimulation, REBALANCE_TOLERANCE};

const CASES: u32 = 2_000;

fn runner() -> TestRunner {
    TestRunner::new(ProptestConfig {
        cases: CASES,
        ..ProptestConfig::default()
    })
}

fn position_strategy() -> impl Strategy<Value = Position> {
    (-40i32..40, 1i32..20, 0u64..4_000_000, 0u64..4_000_000).prop_map(
        |(lower_step, width_steps, a0, a1)| {
            let lower = lower_step * 60;
            Position::new(lower, lower + width_steps * 60, U256::from(a0), U256::from(a1))
        },
    )
}

#[test]
fn test_committed_proposals_never_overdraw_the_starting_inventory() {
    let strategy = (
        0u64..5_000_000,
        0u64..5_000_000,
        -2_000i32..2_000,
        prop::collection::vec(prop::collection::vec(position_strategy(), 0..4), 1..6),
    );
    let result = runner().run(&strategy, |(inv0, inv1, tick, proposals)| {
        let initial = Inventory::new(U256::from(inv0), U256::from(inv1));
        let price = tick_to_price(tick);
        let miner = MinerInfo {
            uid: 1,
            hotkey: "hk".to_string(),
            endpoint: "http://miner.invalid".to_string(),
        };
        let mut sim = MinerSimulation::new(miner, 100, Vec::new(), initial);
        for (step, positions) in proposals.into_iter().enumerate() {
            let reply = RebalanceResponse {
                accepted: true,
                refusal_reason: None,
                desired_positions: Some(positions),
                miner_metadata: None,
            };
            sim.apply_evaluation_step(Some(&reply), 100 + step as u64 * 10, price, price);

            let (used0, used1) = total_deployed_amounts(&sim.positions, price);
            let left = initial.remaining_after(used0, used1).ok_or_else(|| {
                TestCaseError::fail(format!("deployed ({used0}, {used1}) exceeds {initial:?}"))
            })?;
            prop_assert_eq!(left, sim.inventory);
            prop_assert!(sim.positions.iter().all(Position::is_well_formed));
        }
        prop_assert_eq!(sim.history.len() as u32, sim.rebalances + 1);
        Ok(())
    });
    if let Err(err) = result {
        panic!("inventory conservation proptest failed: {err}");
    }
}

#[test]
fn test_tolerance_is_reflexive_and_symmetric() {
    let strategy = (
        prop::collection::vec(position_strategy(), 0..5),
        prop::collection::vec(position_strategy(), 0..5),
        -1e12f64..1e12,
        -1e12f64..1e12,
    );
    let result = runner().run(&strategy, |(a, b, x, y)| {
        prop_assert!(positions_within_tolerance(&a, &a, REBALANCE_TOLERANCE));
        prop_assert!(values_within_tolerance(x, x, REBALANCE_TOLERANCE));
        prop_assert_eq!(
            values_within_tolerance(x, y, REBALANCE_TOLERANCE),
            values_within_tolerance(y, x, REBALANCE_TOLERANCE)
        );
        prop_assert_eq!(
            positions_within_tolerance(&a, &b, REBALANCE_TOLERANCE),
            positions_within_tolerance(&b, &a, REBALANCE_TOLERANCE)
        );
        if a.len() != b.len() {
            prop_assert!(!positions_within_tolerance(&a, &b, REBALANCE_TOLERANCE));
        }
        Ok(())
    });
    if let Err(err) = result {
        panic!("tolerance proptest failed: {err}");
    }
}

#[test]
fn test_check_schedule_fires_once_per_aligned_slot() {
    let strategy = (
        0u64..1_000_000,
        1u64..50,
        prop::collection::vec(1u64..40, 1..200),
    );
    let result = runner().run(&strategy, |(start, interval, steps)| {
        let mut schedule = CheckSchedule::new(start, interval);
        let mut block = start;
        let mut fired: Vec<u64> = Vec::new();
        for step in steps {
            if schedule.is_due(block) {
                schedule.mark_checked(block);
                fired.push(block);
                prop_assert!(!schedule.is_due(block));
                prop_assert_eq!((schedule.next_check() - start) % interval, 0);
                prop_assert!(schedule.next_check() > block);
            }
            block += step;
        }
        prop_assert_eq!(fired.first().copied(), Some(start));
        for pair in fired.windows(2) {
            // Never two checks inside the same interval slot.
            prop_assert!((pair[1] - start) / interval > (pair[0] - start) / interval);
        }
        Ok(())
    });
    if let Err(err) = result {
        panic!("check schedule proptest failed: {err}");
    }
}
