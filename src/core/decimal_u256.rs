//! Serde adapter that writes `U256` as a base-10 string.
//!
//! Peers and the execution service exchange raw token amounts as decimal strings. Reads also
//! accept `0x`-prefixed hex and plain JSON integers.

use alloy::primitives::U256;
use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DecimalU256Visitor)
}

pub fn parse(raw: &str) -> Option<U256> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x") {
        return U256::from_str_radix(hex, 16).ok();
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return U256::from_str_radix(s, 10).ok();
    }
    None
}

struct DecimalU256Visitor;

impl<'de> Visitor<'de> for DecimalU256Visitor {
    type Value = U256;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative integer as decimal string, hex string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<U256, E> {
        parse(v).ok_or_else(|| E::custom(format!("invalid token amount `{v}`")))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<U256, E> {
        Ok(U256::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<U256, E> {
        u64::try_from(v)
            .map(U256::from)
            .map_err(|_| E::custom(format!("negative token amount {v}")))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<U256, E> {
        Ok(U256::from(v))
    }
}
