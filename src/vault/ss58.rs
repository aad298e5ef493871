//! SS58 address decoding for Bittensor hotkeys.

use blake2::{Blake2b512, Digest};
use thiserror::Error;

const CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const ACCOUNT_ID_LEN: usize = 32;
const CHECKSUM_LEN: usize = 2;
const MIN_DECODED_LEN: usize = 35;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Ss58Error {
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("invalid SS58 address length {0}")]
    Length(usize),
    #[error("invalid SS58 checksum")]
    Checksum,
}

/// Decodes an SS58 address to its 32-byte AccountId.
pub fn ss58_to_account_id(address: &str) -> Result<[u8; ACCOUNT_ID_LEN], Ss58Error> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(|e| Ss58Error::Base58(e.to_string()))?;
    if data.len() < MIN_DECODED_LEN {
        return Err(Ss58Error::Length(data.len()));
    }

    let prefix_len = if data[0] & 0b0100_0000 != 0 { 2 } else { 1 };
    let payload_end = prefix_len + ACCOUNT_ID_LEN;
    let checksum_end = payload_end + CHECKSUM_LEN;
    if data.len() < checksum_end {
        return Err(Ss58Error::Length(data.len()));
    }

    let mut hasher = Blake2b512::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(&data[..payload_end]);
    let digest = hasher.finalize();
    if data[payload_end..checksum_end] != digest[..CHECKSUM_LEN] {
        return Err(Ss58Error::Checksum);
    }

    let mut account = [0u8; ACCOUNT_ID_LEN];
    account.copy_from_slice(&data[prefix_len..payload_end]);
    Ok(account)
}

pub fn is_valid_ss58(address: &str) -> bool {
    ss58_to_account_id(address).is_ok()
}
