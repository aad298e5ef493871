//! Concentrated-liquidity math for Uniswap V3 style pools (Aerodrome Slipstream uses the same
//! curve).
//!
//! Two flavours live here. The integer functions work on Q64.96 square-root prices and mirror the
//! on-chain formulas, with products widened to 512 bits. The float functions drive the backtester,
//! where prices arrive as plain `token1/token0` ratios.
//!
//! Any division whose denominator could be zero returns zero instead.

use crate::core::Position;
use alloy::primitives::{U256, U512};

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;
pub const TICK_BASE: f64 = 1.0001;

/// 2^96 as a float. Exact, since it is a power of two.
pub const Q96_F64: f64 = 79_228_162_514_264_337_593_543_950_336.0;

pub fn q96() -> U256 {
    U256::from(1u64) << 96
}

fn widen(v: U256) -> U512 {
    let l = v.as_limbs();
    U512::from_limbs([l[0], l[1], l[2], l[3], 0, 0, 0, 0])
}

fn narrow_saturating(v: U512) -> U256 {
    let l = v.as_limbs();
    if l[4..].iter().any(|limb| *limb != 0) {
        return U256::MAX;
    }
    U256::from_limbs([l[0], l[1], l[2], l[3]])
}

fn mul_div(a: U256, b: U256, c: U256, denominator: U512) -> U256 {
    if denominator.is_zero() {
        return U256::ZERO;
    }
    narrow_saturating(widen(a) * widen(b) * widen(c) / denominator)
}

pub fn u256_to_f64(v: U256) -> f64 {
    v.as_limbs()
        .iter()
        .rev()
        .fold(0.0f64, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// Floors a non-negative float into token units. NaN and negatives map to zero, overflow saturates.
pub fn f64_to_u256_floor(x: f64) -> U256 {
    if !x.is_finite() {
        return if x == f64::INFINITY { U256::MAX } else { U256::ZERO };
    }
    if x < 1.0 {
        return U256::ZERO;
    }
    let floored = x.floor();
    let bits = floored.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i64 - 1075;
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);
    if exponent >= 0 {
        if exponent > 203 {
            return U256::MAX;
        }
        U256::from(mantissa) << (exponent as usize)
    } else {
        U256::from(mantissa >> ((-exponent) as u32))
    }
}

pub fn clamp_tick(tick: i32) -> i32 {
    tick.clamp(MIN_TICK, MAX_TICK)
}

/// Q64.96 square-root price at `tick`, with the tick clamped to the valid range.
pub fn sqrt_ratio_at_tick(tick: i32) -> U256 {
    let tick = clamp_tick(tick);
    f64_to_u256_floor(TICK_BASE.powf(tick as f64 / 2.0) * Q96_F64)
}

pub fn tick_at_sqrt_ratio(sqrt_price_x96: U256) -> i32 {
    if sqrt_price_x96.is_zero() {
        return MIN_TICK;
    }
    price_to_tick(sqrt_price_x96_to_price(sqrt_price_x96))
}

pub fn sqrt_price_x96_to_price(sqrt_price_x96: U256) -> f64 {
    let ratio = u256_to_f64(sqrt_price_x96) / Q96_F64;
    ratio * ratio
}

pub fn tick_to_price(tick: i32) -> f64 {
    TICK_BASE.powi(tick)
}

pub fn price_to_tick(price: f64) -> i32 {
    if !(price > 0.0) || !price.is_finite() {
        return MIN_TICK;
    }
    let raw = price.ln() / TICK_BASE.ln();
    if raw <= MIN_TICK as f64 {
        MIN_TICK
    } else if raw >= MAX_TICK as f64 {
        MAX_TICK
    } else {
        raw.trunc() as i32
    }
}

/// Liquidity supplied by `(amount0, amount1)` over `[sqrt_a, sqrt_b]` at `sqrt_price`.
///
/// In range, the smaller of the two single-sided liquidities wins. If one side is zero, the other
/// side alone is used.
pub fn liquidity_for_amounts(
    sqrt_price_x96: U256,
    sqrt_a_x96: U256,
    sqrt_b_x96: U256,
    amount0: U256,
    amount1: U256,
) -> U256 {
    let (lo, hi) = if sqrt_a_x96 > sqrt_b_x96 {
        (sqrt_b_x96, sqrt_a_x96)
    } else {
        (sqrt_a_x96, sqrt_b_x96)
    };
    let q96 = q96();

    if sqrt_price_x96 <= lo {
        if hi == lo {
            return U256::ZERO;
        }
        mul_div(amount0, lo, hi, widen(hi - lo) * widen(q96))
    } else if sqrt_price_x96 < hi {
        let liquidity0 = mul_div(
            amount0,
            sqrt_price_x96,
            hi,
            widen(hi - sqrt_price_x96) * widen(q96),
        );
        let liquidity1 = mul_div(amount1, q96, U256::from(1u64), widen(sqrt_price_x96 - lo));
        if !liquidity0.is_zero() && !liquidity1.is_zero() {
            liquidity0.min(liquidity1)
        } else {
            liquidity0.max(liquidity1)
        }
    } else {
        if hi == lo {
            return U256::ZERO;
        }
        mul_div(amount1, q96, U256::from(1u64), widen(hi - lo))
    }
}

/// Token amounts represented by `liquidity` over `[sqrt_a, sqrt_b]` at `sqrt_price`.
pub fn amounts_for_liquidity(
    sqrt_price_x96: U256,
    sqrt_a_x96: U256,
    sqrt_b_x96: U256,
    liquidity: U256,
) -> (U256, U256) {
    let (lo, hi) = if sqrt_a_x96 > sqrt_b_x96 {
        (sqrt_b_x96, sqrt_a_x96)
    } else {
        (sqrt_a_x96, sqrt_b_x96)
    };
    if liquidity.is_zero() {
        return (U256::ZERO, U256::ZERO);
    }
    let q96 = q96();

    if sqrt_price_x96 <= lo {
        if lo.is_zero() || hi.is_zero() {
            return (U256::ZERO, U256::ZERO);
        }
        let amount0 = mul_div(liquidity, hi - lo, q96, widen(lo) * widen(hi));
        (amount0, U256::ZERO)
    } else if sqrt_price_x96 < hi {
        if hi.is_zero() {
            return (U256::ZERO, U256::ZERO);
        }
        let amount0 = mul_div(
            liquidity,
            hi - sqrt_price_x96,
            q96,
            widen(sqrt_price_x96) * widen(hi),
        );
        let amount1 = mul_div(
            liquidity,
            sqrt_price_x96 - lo,
            U256::from(1u64),
            widen(q96),
        );
        (amount0, amount1)
    } else {
        let amount1 = mul_div(liquidity, hi - lo, U256::from(1u64), widen(q96));
        (U256::ZERO, amount1)
    }
}

/// Liquidity and the token amounts actually deployed by `position` at `price`.
///
/// Only the limiting token is fully used. The excess of the other token is left undeployed and
/// stays with the holder as idle inventory.
pub fn position_liquidity_and_amounts(position: &Position, price: f64) -> (f64, f64, f64) {
    let price_lower = tick_to_price(position.tick_lower);
    let price_upper = tick_to_price(position.tick_upper);
    let sqrt_lower = price_lower.sqrt();
    let sqrt_upper = price_upper.sqrt();
    let sqrt_price = if price > 0.0 { price.sqrt() } else { 0.0 };

    let alloc0 = u256_to_f64(position.allocation0);
    let alloc1 = u256_to_f64(position.allocation1);

    if !(sqrt_upper > sqrt_lower) || !(sqrt_price > 0.0) {
        return (0.0, 0.0, 0.0);
    }

    let (liquidity, used0, used1) = if price <= price_lower {
        let liquidity = alloc0 * sqrt_lower * sqrt_upper / (sqrt_upper - sqrt_lower);
        (liquidity, alloc0, 0.0)
    } else if price >= price_upper {
        let liquidity = alloc1 / (sqrt_upper - sqrt_lower);
        (liquidity, 0.0, alloc1)
    } else {
        let liquidity0 = if sqrt_upper > sqrt_price {
            alloc0 * sqrt_price * sqrt_upper / (sqrt_upper - sqrt_price)
        } else {
            0.0
        };
        let liquidity1 = if sqrt_price > sqrt_lower {
            alloc1 / (sqrt_price - sqrt_lower)
        } else {
            0.0
        };
        let liquidity = if liquidity0 > 0.0 && liquidity1 > 0.0 {
            liquidity0.min(liquidity1)
        } else {
            liquidity0.max(liquidity1)
        };
        if liquidity > 0.0 {
            let used0 = liquidity * (sqrt_upper - sqrt_price) / (sqrt_price * sqrt_upper);
            let used1 = liquidity * (sqrt_price - sqrt_lower);
            (liquidity, used0, used1)
        } else {
            (0.0, 0.0, 0.0)
        }
    };

    (liquidity.max(0.0), used0.max(0.0), used1.max(0.0))
}

/// Deployed amounts of `position` at `price`, floored to token units.
pub fn deployed_amounts(position: &Position, price: f64) -> (U256, U256) {
    let (_, used0, used1) = position_liquidity_and_amounts(position, price);
    (f64_to_u256_floor(used0), f64_to_u256_floor(used1))
}

/// Sum of the deployed amounts of every position at `price`.
pub fn total_deployed_amounts(positions: &[Position], price: f64) -> (U256, U256) {
    positions
        .iter()
        .fold((U256::ZERO, U256::ZERO), |(acc0, acc1), position| {
            let (used0, used1) = deployed_amounts(position, price);
            (acc0.saturating_add(used0), acc1.saturating_add(used1))
        })
}

/// Token amounts behind an on-chain position's raw liquidity at the pool's current sqrt price.
pub fn amounts_for_position_liquidity(
    sqrt_price_x96: U256,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: U256,
) -> (U256, U256) {
    amounts_for_liquidity(
        sqrt_price_x96,
        sqrt_ratio_at_tick(tick_lower),
        sqrt_ratio_at_tick(tick_upper),
        liquidity,
    )
}
