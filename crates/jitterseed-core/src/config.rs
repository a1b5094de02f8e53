//! Runtime configuration and operational overrides.
//!
//! Layering, lowest priority first:
//!
//! 1. [`Config::default`]: the empirically tuned constants.
//! 2. A JSON file named by `JITTERSEED_CONFIG`, if set.
//! 3. Individual `JITTERSEED_*` environment variables.
//!
//! The JSON layout mirrors the serde representation of [`Config`] and is not
//! a stable on-disk format.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::source::SourceKind;

/// Environment variable naming a JSON config file.
pub const ENV_CONFIG: &str = "JITTERSEED_CONFIG";
/// Forced loop delay; bypasses tuning.
pub const ENV_LOOP_DELAY: &str = "JITTERSEED_LOOP_DELAY";
/// Forced counter shift; bypasses calibration.
pub const ENV_SHIFT: &str = "JITTERSEED_SHIFT";
/// Forced noise source (`timer`, `os_rng`, `hw_rng`).
pub const ENV_SOURCE: &str = "JITTERSEED_SOURCE";
/// Forced tuning algorithm (`heuristic`, `entropy`).
pub const ENV_TUNER: &str = "JITTERSEED_TUNER";
/// Restrict failover to FIPS-eligible sources.
pub const ENV_REQUIRE_FIPS: &str = "JITTERSEED_REQUIRE_FIPS";

/// Loop-delay tuning algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerKind {
    /// State-change / run-length / parity sweep over the prime table.
    #[default]
    Heuristic,
    /// Sweep accepting the first delay with a ≥ 50 % entropy estimate.
    Entropy,
}

impl std::str::FromStr for TunerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" | "h" => Ok(Self::Heuristic),
            "entropy" | "estimate" | "e" => Ok(Self::Entropy),
            other => Err(Error::Config(format!("unknown tuner '{other}'"))),
        }
    }
}

/// Retry bounds and time windows.
///
/// These values were tuned empirically rather than derived; they are kept
/// overridable so deployments can adjust them without a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Consecutive health-test failures before a raw fetch errors out.
    pub max_health_failures: u32,
    /// Regenerations allowed when an output repeats the previous one.
    pub max_duplicate_retries: u32,
    /// Consecutive filter bursts without enough buckets before giving up.
    pub max_filter_failures: u32,
    /// Failed bursts after which the loop delay is halved instead of grown.
    pub filter_halve_after: u32,
    /// Minimum surviving histogram buckets for a burst to count as noise.
    pub min_buckets: usize,
    /// Error-free run time after which a failing source is reinitialised in place.
    pub stable_window_secs: u64,
    /// A fallback source used more recently than this disables the subsystem.
    pub min_reuse_secs: u64,
    /// Largest single seed request in bytes.
    pub max_request: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_health_failures: 9,
            max_duplicate_retries: 3,
            max_filter_failures: 32,
            filter_halve_after: 8,
            min_buckets: 3,
            stable_window_secs: 7 * 24 * 60 * 60,
            min_reuse_secs: 60 * 60,
            max_request: 65_536,
        }
    }
}

impl Limits {
    pub fn stable_window(&self) -> Duration {
        Duration::from_secs(self.stable_window_secs)
    }

    pub fn min_reuse(&self) -> Duration {
        Duration::from_secs(self.min_reuse_secs)
    }
}

/// Complete configuration for a seed provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Forced loop delay in idle iterations.
    pub loop_delay: Option<u32>,
    /// Forced count of low counter bits to discard.
    pub shift: Option<u32>,
    /// Forced noise source; disables automatic initial selection.
    pub source: Option<SourceKind>,
    /// Tuning algorithm used when no loop delay is forced.
    pub tuner: TunerKind,
    /// Only FIPS-eligible sources may be selected.
    pub require_fips: bool,
    pub limits: Limits,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a JSON configuration file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `JITTERSEED_*` overrides using `lookup` to read variables.
    ///
    /// Empty values are ignored so an exported-but-blank variable does not
    /// clobber a file setting.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_LOOP_DELAY) {
            self.loop_delay = Some(parse_number(ENV_LOOP_DELAY, &v)?);
        }
        if let Some(v) = get(ENV_SHIFT) {
            let shift: u32 = parse_number(ENV_SHIFT, &v)?;
            if shift >= 64 {
                return Err(Error::Config(format!("{ENV_SHIFT}={shift} exceeds 63")));
            }
            self.shift = Some(shift);
        }
        if let Some(v) = get(ENV_SOURCE) {
            self.source = Some(v.parse()?);
        }
        if let Some(v) = get(ENV_TUNER) {
            self.tuner = v.parse()?;
        }
        if let Some(v) = get(ENV_REQUIRE_FIPS) {
            self.require_fips = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    /// Serialise the effective configuration (for diagnostics).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: '{value}' is not a valid number")))
}
