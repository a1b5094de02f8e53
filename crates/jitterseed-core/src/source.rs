//! Noise-source plug-in contract.
//!
//! Every concrete source (timer jitter, OS RNG, CPU RNG) implements
//! [`NoiseSource`] and describes itself with a static [`SourceInfo`]. The
//! [`SourceKind`] tag selects among them in the supervisor's registry.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Known noise-source types, in registry (failover) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Calibrated, filtered CPU timer jitter.
    Timer,
    /// Operating-system RNG.
    OsRng,
    /// CPU hardware RNG instruction.
    HwRng,
}

impl SourceKind {
    /// Every kind in registry order.
    pub const ALL: [SourceKind; 3] = [SourceKind::Timer, SourceKind::OsRng, SourceKind::HwRng];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::OsRng => "os_rng",
            Self::HwRng => "hw_rng",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timer" | "jitter" => Ok(Self::Timer),
            "os_rng" | "os" | "osrng" => Ok(Self::OsRng),
            "hw_rng" | "hw" | "hwrng" | "rdseed" => Ok(Self::HwRng),
            other => Err(Error::Config(format!("unknown noise source '{other}'"))),
        }
    }
}

/// Static description of a noise source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub kind: SourceKind,
    /// Unique identifier (e.g. `"timer"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// Raw bits consumed per bit of output entropy.
    pub bits_needed: u32,
    /// Whether the source may be used when FIPS-eligible sources are required.
    pub fips_eligible: bool,
}

impl SourceInfo {
    /// Declared entropy guarantee as a percentage.
    pub fn guarantee_percent(&self) -> u32 {
        100 / self.bits_needed.max(1)
    }
}

/// Trait every noise source implements.
///
/// Call order is `available` → `preinit` → `init` → `get_bytes`* → `cleanup`.
/// `get_bytes` returns raw, unconditioned noise; health testing and
/// conditioning happen in the TRNG.
pub trait NoiseSource: Send {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Whether the source can operate on this machine.
    fn available(&mut self) -> bool;

    /// One-time global setup (calibration, tuning). Re-runs when `force_reinit`.
    fn preinit(&mut self, force_reinit: bool) -> Result<()>;

    /// Per-instance setup. `personalization` distinguishes instances.
    fn init(&mut self, personalization: &[u8]) -> Result<()>;

    /// Fill `buf` with raw noise bytes.
    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Release per-instance state. The source may be `init`ed again later.
    fn cleanup(&mut self);

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }
}

/// Registry view of a source: what the supervisor needs to choose among them.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub name: &'static str,
    pub available: bool,
    pub fips_eligible: bool,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, available: bool, fips_eligible: bool) -> Self {
        Self {
            kind,
            name: kind.name(),
            available,
            fips_eligible,
        }
    }
}

/// Builds sources for the supervisor-driven [`crate::Nrbg`].
pub trait SourceProvider: Send + Sync {
    /// Registry entries, one per known kind.
    fn descriptors(&self) -> Vec<SourceDescriptor>;

    /// A fresh, not yet initialised source of `kind`.
    fn build(&self, kind: SourceKind) -> Option<Box<dyn NoiseSource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_name() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.name().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("quantum".parse::<SourceKind>().is_err());
    }

    #[test]
    fn guarantee_percent_from_bits_needed() {
        let info = SourceInfo {
            kind: SourceKind::Timer,
            name: "timer",
            description: "",
            bits_needed: 2,
            fips_eligible: true,
        };
        assert_eq!(info.guarantee_percent(), 50);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&SourceKind::OsRng).unwrap();
        assert_eq!(json, "\"os_rng\"");
    }
}
