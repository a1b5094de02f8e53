//! Power-on and post-switch self tests.
//!
//! Known answers for the keyed hash and the digest, plus sanity checks that
//! the health tests and the estimator still tell noise from a stuck source.
//! Every failure is reported as an initialisation failure.

use sha2::{Digest, Sha256};

use crate::conditioner::hmac_sha256;
use crate::error::{Error, Result};
use crate::estimator::{EntropyEstimator, FLUSH_INTERVAL};
use crate::health::{BLOCK_LEN, HealthTestEngine};
use crate::trng::ESTIMATOR_GUARANTEE;

/// RFC 4231 test case 2.
const HMAC_KEY: &[u8] = b"Jefe";
const HMAC_DATA: &[u8] = b"what do ya want for nothing?";
const HMAC_EXPECTED: [u8; 32] = [
    0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95, 0x75, 0xc7,
    0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9, 0x64, 0xec, 0x38, 0x43,
];

/// FIPS 180-2 "abc".
const SHA256_EXPECTED: [u8; 32] = [
    0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22, 0x23,
    0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00, 0x15, 0xad,
];

/// Deterministic, statistically flat test vector: SHA-256 in counter mode.
fn flat_bytes(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = 0u64;
    while out.len() < len {
        let mut h = Sha256::new();
        h.update(b"jitterseed-selftest");
        h.update(i.to_le_bytes());
        out.extend_from_slice(&h.finalize());
        i += 1;
    }
    out.truncate(len);
    out
}

fn fail(what: &str) -> Error {
    log::error!("self test failed: {what}");
    Error::InitializationFailure(format!("self test failed: {what}"))
}

pub fn hmac_known_answer() -> Result<()> {
    if hmac_sha256(HMAC_KEY, HMAC_DATA)? != HMAC_EXPECTED {
        return Err(fail("HMAC-SHA-256 known answer"));
    }
    Ok(())
}

pub fn sha256_known_answer() -> Result<()> {
    if Sha256::digest(b"abc").as_slice() != SHA256_EXPECTED {
        return Err(fail("SHA-256 known answer"));
    }
    Ok(())
}

/// A stuck block must fail and a flat block must pass at every guarantee.
pub fn health_sanity() -> Result<()> {
    let stuck = [0x3Cu8; BLOCK_LEN];
    let flat = flat_bytes(BLOCK_LEN);
    for guarantee in [25, 50, 75, 100] {
        if HealthTestEngine::run(guarantee, &stuck).passed() {
            return Err(fail("health tests accepted a stuck block"));
        }
        if !HealthTestEngine::run(guarantee, &flat).passed() {
            return Err(fail("health tests rejected a flat block"));
        }
    }
    Ok(())
}

/// A constant interval must trip the estimator and a flat one must not.
pub fn estimator_sanity() -> Result<()> {
    let mut constant = EntropyEstimator::new();
    constant.feed(&[0u8; FLUSH_INTERVAL])?;
    if constant.entropy_ok(ESTIMATOR_GUARANTEE) {
        return Err(fail("estimator accepted a constant stream"));
    }

    let mut flat = EntropyEstimator::new();
    flat.feed(&flat_bytes(FLUSH_INTERVAL))?;
    if !flat.entropy_ok(ESTIMATOR_GUARANTEE) {
        return Err(fail("estimator rejected a flat stream"));
    }
    Ok(())
}

/// Run every self test, stopping at the first failure.
pub fn run_all() -> Result<()> {
    hmac_known_answer()?;
    sha256_known_answer()?;
    health_sanity()?;
    estimator_sanity()?;
    log::debug!("self tests passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_self_tests_pass() {
        run_all().unwrap();
    }

    #[test]
    fn flat_bytes_is_deterministic() {
        assert_eq!(flat_bytes(100), flat_bytes(100));
        assert_eq!(flat_bytes(33).len(), 33);
        assert_eq!(flat_bytes(64)[..32], flat_bytes(32)[..]);
    }
}
