//! CPU hardware RNG (`RDSEED`) noise source.
//!
//! `RDSEED` returns conditioned-at-source seed material straight from the
//! on-die entropy source. It can transiently underflow under load, so each
//! word is retried a bounded number of times. Unavailable on every other
//! architecture.

use crate::error::{Error, Result};
use crate::source::{NoiseSource, SourceInfo, SourceKind};

static HW_RNG_INFO: SourceInfo = SourceInfo {
    kind: SourceKind::HwRng,
    name: "hw_rng",
    description: "CPU on-die entropy source via the RDSEED instruction",
    bits_needed: 1,
    fips_eligible: false,
};

/// Attempts per 64-bit word before giving up.
pub const RDSEED_RETRIES: u32 = 128;

/// Whether the CPU advertises `RDSEED`.
pub fn rdseed_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("rdseed")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rdseed")]
#[allow(unused_unsafe)]
unsafe fn rdseed_word() -> Option<u64> {
    let mut value = 0u64;
    for _ in 0..RDSEED_RETRIES {
        // SAFETY: caller checked CPU support; the intrinsic only writes `value`.
        if unsafe { core::arch::x86_64::_rdseed64_step(&mut value) } == 1 {
            return Some(value);
        }
        std::hint::spin_loop();
    }
    None
}

fn read_word() -> Option<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        if rdseed_supported() {
            // SAFETY: support was detected at runtime just above.
            return unsafe { rdseed_word() };
        }
        None
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        None
    }
}

/// RDSEED noise source.
#[derive(Debug, Default)]
pub struct HwRngSource {
    ready: bool,
}

impl HwRngSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoiseSource for HwRngSource {
    fn info(&self) -> &SourceInfo {
        &HW_RNG_INFO
    }

    fn available(&mut self) -> bool {
        rdseed_supported() && read_word().is_some()
    }

    fn preinit(&mut self, _force_reinit: bool) -> Result<()> {
        if rdseed_supported() {
            Ok(())
        } else {
            Err(Error::InitializationFailure("RDSEED not supported by this CPU".into()))
        }
    }

    fn init(&mut self, _personalization: &[u8]) -> Result<()> {
        self.preinit(false)?;
        self.ready = true;
        Ok(())
    }

    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.ready {
            return Err(Error::InitializationFailure("hw rng not initialised".into()));
        }
        for chunk in buf.chunks_mut(8) {
            let Some(word) = read_word() else {
                log::warn!("RDSEED underflow after {RDSEED_RETRIES} attempts");
                return Err(Error::EntropyInsufficient(
                    "RDSEED returned no data".into(),
                ));
            };
            chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.ready = false;
    }
}
