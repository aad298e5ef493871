use blake2::{Blake2b512, Digest};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestRunner};
use sn98_validator::vault::normalize_hotkey_to_bytes32;
use sn98_validator::vault::ss58::{ss58_to_account_id, Ss58Error};

fn encode_ss58(prefix: u8, account: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(35);
    data.push(prefix);
    data.extend_from_slice(account);
    let mut hasher = Blake2b512::new();
    hasher.update(b"SS58PRE");
    hasher.update(&data);
    let digest = hasher.finalize();
    data.extend_from_slice(&digest[..2]);
    data
}

fn runner() -> TestRunner {
    TestRunner::new(ProptestConfig {
        cases: 2_000,
        ..ProptestConfig::default()
    })
}

#[test]
fn test_ss58_decodes_what_it_was_given() {
    let strategy = (0u8..64, any::<[u8; 32]>());
    let result = runner().run(&strategy, |(prefix, account)| {
        let address = bs58::encode(encode_ss58(prefix, &account)).into_string();
        prop_assert_eq!(ss58_to_account_id(&address), Ok(account));
        prop_assert_eq!(normalize_hotkey_to_bytes32(&address), hex::encode(account));
        Ok(())
    });
    if let Err(err) = result {
        panic!("ss58 decode proptest failed: {err}");
    }
}

#[test]
fn test_ss58_corruption_is_rejected() {
    let strategy = (0u8..64, any::<[u8; 32]>(), 0usize..35, 1u8..=255);
    let result = runner().run(&strategy, |(prefix, account, idx, flip)| {
        let mut raw = encode_ss58(prefix, &account);
        raw[idx] ^= flip;
        // Flipping the prefix into the two-byte range changes the layout, not just the checksum.
        prop_assume!(raw[0] & 0b0100_0000 == 0);
        let mut hasher = Blake2b512::new();
        hasher.update(b"SS58PRE");
        hasher.update(&raw[..33]);
        prop_assume!(hasher.finalize()[..2] != raw[33..35], "checksum collision");
        let address = bs58::encode(&raw).into_string();
        prop_assert_eq!(ss58_to_account_id(&address), Err(Ss58Error::Checksum));
        Ok(())
    });
    if let Err(err) = result {
        panic!("ss58 corruption proptest failed: {err}");
    }
}
