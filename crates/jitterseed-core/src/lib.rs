//! # jitterseed-core
//!
//! **Seed material from the jitter between two clock reads.**
//!
//! `jitterseed-core` harvests timing noise from the CPU's cycle counter,
//! tests it continuously and conditions it into seed bytes for a
//! deterministic random bit generator. When the timer misbehaves, a
//! supervisor fails over to the OS RNG or the CPU's RDSEED instruction.
//!
//! ## Quick Start
//!
//! ```no_run
//! use jitterseed_core::{Config, Nrbg};
//!
//! let mut nrbg = Nrbg::new(Config::default())?;
//! let seed = nrbg.generate_seed(48)?;
//! assert_eq!(seed.len(), 48);
//! # Ok::<(), jitterseed_core::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! counter ─► Calibrator (shift) ─► tuner (loop delay)
//!        ─► NoiseFilter ─► HealthTestEngine ─► Conditioner (HMAC-SHA-256)
//!        ─► duplicate check ─► EntropyEstimator ─► seed
//! ```
//!
//! Every noise source implements [`NoiseSource`]. A [`Trng`] drives one
//! source end to end; [`Nrbg`] wraps it with the [`Supervisor`]'s failover
//! policy and the self tests.
//!
//! Runtime overrides (`JITTERSEED_LOOP_DELAY`, `JITTERSEED_SHIFT`,
//! `JITTERSEED_SOURCE`, `JITTERSEED_TUNER`, `JITTERSEED_REQUIRE_FIPS`) are
//! read by [`Config::from_env`].

pub mod calibrate;
pub mod conditioner;
pub mod config;
pub mod counter;
pub mod error;
pub mod estimator;
pub mod filter;
pub mod health;
pub mod nrbg;
pub mod personalization;
pub mod secret;
pub mod selftest;
pub mod source;
pub mod sources;
pub mod supervisor;
pub mod trng;
pub mod tune;

pub use calibrate::{Calibration, Calibrator};
pub use conditioner::{Conditioner, RawEntropy};
pub use config::{Config, Limits, TunerKind};
pub use counter::{CounterSource, HardwareCounter, read_raw_counter};
pub use error::{Error, FaultKind, Result};
pub use estimator::EntropyEstimator;
pub use filter::{FilterState, FilterStats, NoiseFilter};
pub use health::{HealthTestEngine, HealthTestState, Verdict};
pub use nrbg::Nrbg;
pub use personalization::Personalization;
pub use source::{NoiseSource, SourceDescriptor, SourceInfo, SourceKind, SourceProvider};
pub use sources::{HwRngSource, OsRngSource, SourceFactory, TimerSource};
pub use supervisor::{Decision, Supervisor, SupervisorSnapshot};
pub use trng::{Trng, TrngReport, TrngState};
pub use tune::TuneOutcome;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
