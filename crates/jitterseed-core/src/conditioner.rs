//! HMAC-SHA-256 conditioning of health-tested raw noise.
//!
//! Each output digest is
//!
//! ```text
//! HMAC(key, residual || counter || raw_1 || … || raw_g)
//! ```
//!
//! where `g` is the source's "bits needed per bit of entropy" guarantee and
//! every `raw_i` is one [`DIGEST_LEN`]-byte sub-block that already passed the
//! health tests. With a 50 % source, two raw blocks go into every 32 output
//! bytes. Digests are XORed into the destination; the last one is folded into
//! the residual and the key is rolled, so consecutive calls form a dependency
//! chain.
//!
//! This is the only place keyed hashing touches entropy data.

use hmac::{Hmac, Mac};
use sha2::digest::FixedOutput;
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::secret::{SECRET_LEN, SecretBlock};

type HmacSha256 = Hmac<Sha256>;

/// Output size of one conditioning step.
pub const DIGEST_LEN: usize = SECRET_LEN;

const KEY_LABEL: &[u8] = b"jitterseed/conditioner/key";
const RESIDUAL_LABEL: &[u8] = b"jitterseed/conditioner/residual";
const ROLL_LABEL: &[u8] = b"jitterseed/conditioner/roll";
const RESEED_LABEL: &[u8] = b"jitterseed/conditioner/reseed";

/// Supplier of health-tested raw blocks (`trng_raw`).
pub trait RawEntropy {
    /// Fill `out` with raw noise that passed the health tests.
    fn raw_block(&mut self, out: &mut [u8; DIGEST_LEN]) -> Result<()>;
}

/// Rolling-key conditioner state.
pub struct Conditioner {
    key: SecretBlock,
    residual: SecretBlock,
    guarantee: u32,
    counter: u64,
}

impl std::fmt::Debug for Conditioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conditioner")
            .field("guarantee", &self.guarantee)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

fn keyed(key: &SecretBlock) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| Error::InitializationFailure(format!("hmac key setup: {e}")))
}

/// Finalise straight into `into`; the tag never lands in a temporary.
fn finish(mac: HmacSha256, into: &mut SecretBlock) {
    FixedOutput::finalize_into(mac, GenericArray::from_mut_slice(into.as_mut_bytes()));
}

impl Conditioner {
    /// Derive the initial key and residual from personalisation data.
    ///
    /// `guarantee` is the number of raw blocks absorbed per output digest.
    pub fn new(personalization: &[u8], guarantee: u32) -> Result<Self> {
        let mut key = SecretBlock::zeroed();
        let mut h = Sha256::new();
        h.update(KEY_LABEL);
        h.update((personalization.len() as u64).to_le_bytes());
        h.update(personalization);
        Digest::finalize_into(h, GenericArray::from_mut_slice(key.as_mut_bytes()));

        let mut residual = SecretBlock::zeroed();
        let mut mac = keyed(&key)?;
        mac.update(RESIDUAL_LABEL);
        mac.update(personalization);
        finish(mac, &mut residual);

        Ok(Self {
            key,
            residual,
            guarantee: guarantee.max(1),
            counter: 0,
        })
    }

    /// Raw blocks absorbed per output digest.
    pub fn guarantee(&self) -> u32 {
        self.guarantee
    }

    /// Fill `out` with conditioned bytes drawn from `source`.
    ///
    /// If any raw fetch fails, `out` is cleared, the rolling state is left
    /// untouched and the call reports insufficient entropy.
    pub fn condition(&mut self, source: &mut dyn RawEntropy, out: &mut [u8]) -> Result<()> {
        out.fill(0);
        let mut digest = SecretBlock::zeroed();
        let mut raw = SecretBlock::zeroed();
        let mut counter = self.counter;

        for chunk in out.chunks_mut(DIGEST_LEN) {
            let mut mac = keyed(&self.key)?;
            mac.update(self.residual.as_bytes());
            mac.update(&counter.to_le_bytes());
            for _ in 0..self.guarantee {
                if let Err(e) = source.raw_block(raw.as_mut_bytes()) {
                    out.fill(0);
                    return Err(match e {
                        Error::EntropyInsufficient(_) => e,
                        other => Error::EntropyInsufficient(format!("raw block fetch: {other}")),
                    });
                }
                mac.update(raw.as_bytes());
            }
            finish(mac, &mut digest);
            for (dst, src) in chunk.iter_mut().zip(digest.as_bytes()) {
                *dst ^= src;
            }
            counter = counter.wrapping_add(1);
        }

        self.counter = counter;
        self.residual.xor_in(digest.as_bytes());
        self.roll_key(ROLL_LABEL, &[])
    }

    /// Mix caller material into the key.
    pub fn reseed(&mut self, material: &[u8]) -> Result<()> {
        self.roll_key(RESEED_LABEL, material)
    }

    fn roll_key(&mut self, label: &[u8], material: &[u8]) -> Result<()> {
        let mut mac = keyed(&self.key)?;
        mac.update(label);
        mac.update(self.residual.as_bytes());
        mac.update(&self.counter.to_le_bytes());
        mac.update(material);
        finish(mac, &mut self.key);
        Ok(())
    }

    /// Short non-secret fingerprint of the rolling state, for diagnostics.
    pub fn state_fingerprint(&self) -> [u8; 8] {
        let mut h = Sha256::new();
        h.update(b"fingerprint");
        h.update(self.key.as_bytes());
        h.update(self.residual.as_bytes());
        let digest = h.finalize();
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&digest[..8]);
        fp
    }

    /// Zero the key and residual.
    pub fn wipe(&mut self) {
        self.key.wipe();
        self.residual.wipe();
        self.counter = 0;
    }

    pub fn is_wiped(&self) -> bool {
        self.key.is_zero() && self.residual.is_zero()
    }
}

/// HMAC-SHA-256 of `data` under `key`, for self tests.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::InitializationFailure(format!("hmac key setup: {e}")))?;
    mac.update(data);
    let mut out = [0u8; DIGEST_LEN];
    FixedOutput::finalize_into(mac, GenericArray::from_mut_slice(&mut out));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        next: u8,
        calls: usize,
        fail_after: Option<usize>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                next: 0,
                calls: 0,
                fail_after: None,
            }
        }
    }

    impl RawEntropy for Counting {
        fn raw_block(&mut self, out: &mut [u8; DIGEST_LEN]) -> Result<()> {
            if self.fail_after.is_some_and(|n| self.calls >= n) {
                return Err(Error::ContinuousTestFailure("stuck".into()));
            }
            self.calls += 1;
            for b in out.iter_mut() {
                *b = self.next;
                self.next = self.next.wrapping_add(1);
            }
            Ok(())
        }
    }

    #[test]
    fn draws_guarantee_blocks_per_digest() {
        let mut cond = Conditioner::new(b"pers", 2).unwrap();
        let mut src = Counting::new();
        let mut out = [0u8; 70];
        cond.condition(&mut src, &mut out).unwrap();
        // 70 bytes need 3 digests, 2 raw blocks each.
        assert_eq!(src.calls, 6);
        assert!(out.iter().any(|&b| b != 0));
    }

    #[test]
    fn state_rolls_between_calls() {
        let mut cond = Conditioner::new(b"pers", 2).unwrap();
        let mut src = Counting::new();
        let fp0 = cond.state_fingerprint();
        let mut a = [0u8; 32];
        cond.condition(&mut src, &mut a).unwrap();
        let fp1 = cond.state_fingerprint();
        let mut b = [0u8; 32];
        cond.condition(&mut src, &mut b).unwrap();
        let fp2 = cond.state_fingerprint();
        assert_ne!(fp0, fp1);
        assert_ne!(fp1, fp2);
        assert_ne!(a, b);
    }

    #[test]
    fn same_input_different_personalization() {
        let mut a = Conditioner::new(b"instance-a", 1).unwrap();
        let mut b = Conditioner::new(b"instance-b", 1).unwrap();
        let (mut oa, mut ob) = ([0u8; 32], [0u8; 32]);
        a.condition(&mut Counting::new(), &mut oa).unwrap();
        b.condition(&mut Counting::new(), &mut ob).unwrap();
        assert_ne!(oa, ob);
    }

    #[test]
    fn fetch_failure_is_entropy_error_and_clears_output() {
        let mut cond = Conditioner::new(b"pers", 2).unwrap();
        let mut src = Counting::new();
        src.fail_after = Some(3);
        let fp = cond.state_fingerprint();
        let mut out = [0xEEu8; 64];
        let err = cond.condition(&mut src, &mut out).unwrap_err();
        assert!(matches!(err, Error::EntropyInsufficient(_)));
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(cond.state_fingerprint(), fp);
    }

    #[test]
    fn reseed_changes_state() {
        let mut cond = Conditioner::new(b"pers", 2).unwrap();
        let fp = cond.state_fingerprint();
        cond.reseed(b"extra").unwrap();
        assert_ne!(cond.state_fingerprint(), fp);
    }

    #[test]
    fn wipe_zeroes_secrets() {
        let mut cond = Conditioner::new(b"pers", 2).unwrap();
        assert!(!cond.is_wiped());
        cond.wipe();
        assert!(cond.is_wiped());
    }

    #[test]
    fn secrets_are_derived_in_place() {
        let cond = Conditioner::new(b"pers", 1).unwrap();

        let mut h = Sha256::new();
        h.update(KEY_LABEL);
        h.update(4u64.to_le_bytes());
        h.update(b"pers");
        assert_eq!(cond.key.as_bytes()[..], h.finalize()[..]);

        let mut data = RESIDUAL_LABEL.to_vec();
        data.extend_from_slice(b"pers");
        let residual = hmac_sha256(cond.key.as_bytes(), &data).unwrap();
        assert_eq!(cond.residual.as_bytes(), &residual);
    }

    #[test]
    fn hmac_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            tag[..8],
            [0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e]
        );
    }
}
