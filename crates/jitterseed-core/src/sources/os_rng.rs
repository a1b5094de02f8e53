//! Operating-system RNG via `getrandom`.
//!
//! - Linux/Android: `getrandom()` syscall
//! - macOS/iOS: `getentropy()`
//! - Windows: `ProcessPrng`

use crate::error::{Error, Result};
use crate::source::{NoiseSource, SourceInfo, SourceKind};

static OS_RNG_INFO: SourceInfo = SourceInfo {
    kind: SourceKind::OsRng,
    name: "os_rng",
    description: "Operating-system CSPRNG (getrandom/getentropy)",
    bits_needed: 1,
    fips_eligible: false,
};

type FillFn = fn(&mut [u8]) -> std::result::Result<(), getrandom::Error>;

/// OS RNG noise source.
pub struct OsRngSource {
    fill: FillFn,
    ready: bool,
}

impl Default for OsRngSource {
    fn default() -> Self {
        Self::new()
    }
}

impl OsRngSource {
    pub fn new() -> Self {
        Self::with_fill(getrandom::fill)
    }

    /// Source backed by a substitute fill function.
    pub fn with_fill(fill: FillFn) -> Self {
        Self { fill, ready: false }
    }

    fn fill_bytes(&self, buf: &mut [u8]) -> Result<()> {
        (self.fill)(buf).map_err(|e| {
            buf.fill(0);
            Error::EntropyInsufficient(format!("os rng: {e}"))
        })
    }
}

impl NoiseSource for OsRngSource {
    fn info(&self) -> &SourceInfo {
        &OS_RNG_INFO
    }

    fn available(&mut self) -> bool {
        let mut probe = [0u8; 16];
        self.fill_bytes(&mut probe).is_ok()
    }

    fn preinit(&mut self, _force_reinit: bool) -> Result<()> {
        Ok(())
    }

    fn init(&mut self, _personalization: &[u8]) -> Result<()> {
        let mut probe = [0u8; 16];
        self.fill_bytes(&mut probe)
            .map_err(|e| Error::InitializationFailure(e.to_string()))?;
        self.ready = true;
        Ok(())
    }

    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.ready {
            return Err(Error::InitializationFailure("os rng not initialised".into()));
        }
        self.fill_bytes(buf)
    }

    fn cleanup(&mut self) {
        self.ready = false;
    }
}
