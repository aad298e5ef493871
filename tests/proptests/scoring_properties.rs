use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestRunner};
use sn98_validator::engine::scorer::{penalized_score, smooth_max};
use sn98_validator::engine::ScoreParams;
use sn98_validator::storage::blend_combined_score;

fn runner() -> TestRunner {
    TestRunner::new(ProptestConfig {
        cases: 5_000,
        ..ProptestConfig::default()
    })
}

#[test]
fn test_score_is_monotonic_in_value_gain() {
    let strategy = (-1e9f64..1e9, -1e9f64..1e9, 0.0f64..1.0, 0.0f64..1.0);
    let result = runner().run(&strategy, |(a, b, r0, r1)| {
        let params = ScoreParams::default();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(penalized_score(low, r0, r1, params) <= penalized_score(high, r0, r1, params));
        Ok(())
    });
    if let Err(err) = result {
        panic!("score monotonicity proptest failed: {err}");
    }
}

#[test]
fn test_more_inventory_loss_never_scores_higher() {
    let strategy = (-1e9f64..1e9, 0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0);
    let result = runner().run(&strategy, |(gain, r0, r1, extra)| {
        let params = ScoreParams::default();
        let worse = (r0 + extra).min(1.0);
        let baseline = penalized_score(gain, r0, r1, params);
        let slack = 1e-9 * baseline.abs().max(1.0);
        prop_assert!(penalized_score(gain, worse, r1, params) <= baseline + slack);
        // The soft max never undershoots the hard max.
        prop_assert!(smooth_max(r0, r1, params.smooth_beta) >= r0.max(r1));
        Ok(())
    });
    if let Err(err) = result {
        panic!("loss penalty proptest failed: {err}");
    }
}

#[test]
fn test_combined_score_stays_between_previous_and_latest() {
    let strategy = (-1e6f64..1e6, -1e6f64..1e6);
    let result = runner().run(&strategy, |(previous, latest)| {
        let blended = blend_combined_score(Some(previous), latest);
        let (low, high) = if previous <= latest {
            (previous, latest)
        } else {
            (latest, previous)
        };
        prop_assert!(blended >= low - 1e-9 && blended <= high + 1e-9);
        prop_assert_eq!(blend_combined_score(None, latest), latest);
        prop_assert_eq!(blend_combined_score(Some(previous), f64::NAN), previous);
        Ok(())
    });
    if let Err(err) = result {
        panic!("combined score proptest failed: {err}");
    }
}
