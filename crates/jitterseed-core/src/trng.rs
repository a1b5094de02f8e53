//! TRNG facade: one noise source, health tests, conditioner and output checks.
//!
//! ```text
//! NoiseSource ─► 512-byte block ─► HealthTestState ─► 32-byte sub-blocks
//!     ─► Conditioner (HMAC) ─► duplicate check ─► EntropyEstimator ─► caller
//! ```
//!
//! Instances share nothing. Calibration faults are tolerated inside the
//! source; health-test, duplicate and estimator faults fail the request and
//! are meant to be escalated to the [`crate::Supervisor`].

use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::conditioner::{Conditioner, DIGEST_LEN, RawEntropy};
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::estimator::EntropyEstimator;
use crate::health::{BLOCK_LEN, HealthTestState};
use crate::personalization::Personalization;
use crate::secret::SecretBlock;
use crate::source::{NoiseSource, SourceKind};

/// Design guarantee the output estimator is held to, independent of the
/// source: conditioned output must never compress below half its size.
pub const ESTIMATOR_GUARANTEE: u32 = 2;

/// Lifecycle of a TRNG instance. A `Trng` only exists once its source came
/// up, so there is no uninitialised state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrngState {
    Initialized,
    Generating,
    Reseeding,
    ShutDown,
}

/// One health-tested block of raw noise.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RawBlock([u8; BLOCK_LEN]);

impl RawBlock {
    fn new() -> Self {
        Self([0u8; BLOCK_LEN])
    }
}

/// Raw noise waiting to be conditioned, plus its health bookkeeping.
struct RawPool {
    block: RawBlock,
    /// Next unread byte; `BLOCK_LEN` means exhausted.
    offset: usize,
    health: HealthTestState,
    max_failures: u32,
}

impl RawPool {
    fn new(health: HealthTestState, max_failures: u32) -> Self {
        Self {
            block: RawBlock::new(),
            offset: BLOCK_LEN,
            health,
            max_failures: max_failures.max(1),
        }
    }

    /// Replace the block with a fresh one that passes the health tests.
    fn refill(&mut self, source: &mut dyn NoiseSource) -> Result<()> {
        self.offset = BLOCK_LEN;
        for _ in 0..self.max_failures {
            source.get_bytes(&mut self.block.0)?;
            if self.health.check(&self.block.0).passed() {
                self.offset = 0;
                return Ok(());
            }
        }
        self.block.zeroize();
        log::error!(
            "{}: {} consecutive blocks failed health tests",
            source.name(),
            self.health.consecutive_failures
        );
        Err(Error::EntropyInsufficient(format!(
            "{} consecutive raw blocks from {} failed health tests",
            self.health.consecutive_failures,
            source.name()
        )))
    }

    fn wipe(&mut self) {
        self.block.zeroize();
        self.offset = BLOCK_LEN;
    }
}

/// Hands the conditioner health-tested sub-blocks.
struct RawReader<'a> {
    pool: &'a mut RawPool,
    source: &'a mut dyn NoiseSource,
}

impl RawEntropy for RawReader<'_> {
    fn raw_block(&mut self, out: &mut [u8; DIGEST_LEN]) -> Result<()> {
        if self.pool.offset + DIGEST_LEN > BLOCK_LEN {
            self.pool.refill(self.source)?;
        }
        let start = self.pool.offset;
        out.copy_from_slice(&self.pool.block.0[start..start + DIGEST_LEN]);
        self.pool.offset += DIGEST_LEN;
        Ok(())
    }
}

/// Continuous test on output: flags a request identical to the previous one.
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    last: Option<SecretBlock>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `output` digests the same as the last recorded output.
    /// Otherwise `output` becomes the new reference.
    pub fn is_repeat(&mut self, output: &[u8]) -> bool {
        let digest = SecretBlock::from_slice(&Sha256::digest(output));
        if self.last.as_ref().is_some_and(|last| last.ct_eq(&digest)) {
            return true;
        }
        self.last = Some(digest);
        false
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Run `fill` until it produces an output unlike the previous one.
    ///
    /// Each repeat bumps `retries`; more than `max_retries` repeats in a row
    /// zero `out` and fail with a continuous test failure.
    pub fn fill_unique<F>(
        &mut self,
        out: &mut [u8],
        max_retries: u32,
        retries: &mut u64,
        mut fill: F,
    ) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        let mut repeats = 0u32;
        loop {
            fill(out)?;
            if !self.is_repeat(out) {
                return Ok(());
            }
            repeats += 1;
            *retries += 1;
            log::warn!("duplicate output, regenerating ({repeats})");
            if repeats > max_retries {
                out.zeroize();
                return Err(Error::ContinuousTestFailure(
                    "repeated duplicate seeds".into(),
                ));
            }
        }
    }
}

/// Counters exposed through [`Trng::health_report`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrngStats {
    pub requests: u64,
    pub bytes_generated: u64,
    pub duplicate_retries: u64,
    pub reseeds: u64,
}

/// Serialisable snapshot of a TRNG instance.
#[derive(Debug, Clone, Serialize)]
pub struct TrngReport {
    pub state: TrngState,
    pub source: SourceKind,
    pub guarantee_percent: u32,
    pub stats: TrngStats,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub last_block_estimate: f64,
    /// Estimator entropy density, once the first interval was measured.
    pub estimator_entropy_percent: Option<u32>,
}

/// A single-source true random number generator.
pub struct Trng {
    source: Box<dyn NoiseSource>,
    kind: SourceKind,
    state: TrngState,
    conditioner: Conditioner,
    pool: RawPool,
    duplicates: DuplicateDetector,
    estimator: EntropyEstimator,
    limits: Limits,
    stats: TrngStats,
}

impl std::fmt::Debug for Trng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trng")
            .field("source", &self.kind)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Trng {
    /// Bring up `source` using its cached pre-initialisation.
    pub fn new(source: Box<dyn NoiseSource>, limits: Limits) -> Result<Self> {
        Self::with_options(source, limits, false, &[])
    }

    /// Bring up `source`, forcing its pre-initialisation to run again.
    pub fn new_forced(source: Box<dyn NoiseSource>, limits: Limits) -> Result<Self> {
        Self::with_options(source, limits, true, &[])
    }

    /// Full constructor. `extra` is mixed into the personalisation string.
    pub fn with_options(
        mut source: Box<dyn NoiseSource>,
        limits: Limits,
        force_preinit: bool,
        extra: &[u8],
    ) -> Result<Self> {
        let info = source.info().clone();
        if !source.available() {
            return Err(Error::InitializationFailure(format!(
                "noise source {} is not available",
                info.name
            )));
        }
        source.preinit(force_preinit).map_err(as_init_failure)?;

        let personalization = Personalization::gather(extra);
        source
            .init(personalization.as_bytes())
            .map_err(as_init_failure)?;
        let conditioner = Conditioner::new(personalization.as_bytes(), info.bits_needed)?;

        let health = HealthTestState::new(info.kind as u32, info.guarantee_percent());
        log::info!(
            "trng up on {} ({}% guarantee, {} raw blocks per digest)",
            info.name,
            info.guarantee_percent(),
            conditioner.guarantee()
        );

        Ok(Self {
            source,
            kind: info.kind,
            state: TrngState::Initialized,
            conditioner,
            pool: RawPool::new(health, limits.max_health_failures),
            duplicates: DuplicateDetector::new(),
            estimator: EntropyEstimator::new(),
            limits,
            stats: TrngStats::default(),
        })
    }

    pub fn state(&self) -> TrngState {
        self.state
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Diagnostic fingerprint of the conditioner state.
    pub fn state_fingerprint(&self) -> [u8; 8] {
        self.conditioner.state_fingerprint()
    }

    fn check_live(&self) -> Result<()> {
        match self.state {
            TrngState::ShutDown => Err(Error::InitializationFailure(format!(
                "trng on {} is not running",
                self.kind
            ))),
            _ => Ok(()),
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len == 0 || len > self.limits.max_request {
            return Err(Error::RequestSize {
                requested: len,
                max: self.limits.max_request,
            });
        }
        Ok(())
    }

    /// Fill `out` with conditioned seed material. On error `out` is zeroed.
    pub fn generate(&mut self, out: &mut [u8]) -> Result<()> {
        self.check_live()?;
        self.check_len(out.len())?;
        self.state = TrngState::Generating;
        self.stats.requests += 1;

        if let Err(e) = self.generate_checked(out) {
            out.fill(0);
            log::error!("trng on {}: {e}", self.kind);
            return Err(e);
        }
        self.stats.bytes_generated += out.len() as u64;
        Ok(())
    }

    fn generate_checked(&mut self, out: &mut [u8]) -> Result<()> {
        let conditioner = &mut self.conditioner;
        let pool = &mut self.pool;
        let source = self.source.as_mut();
        self.duplicates.fill_unique(
            out,
            self.limits.max_duplicate_retries,
            &mut self.stats.duplicate_retries,
            |buf| {
                let mut reader = RawReader {
                    pool: &mut *pool,
                    source: &mut *source,
                };
                conditioner.condition(&mut reader, buf)
            },
        )?;

        self.estimator.feed(out)?;
        if !self.estimator.entropy_ok(ESTIMATOR_GUARANTEE) {
            return Err(Error::EntropyInsufficient(format!(
                "output estimator reports {}% entropy",
                self.estimator.entropy_percent()
            )));
        }
        Ok(())
    }

    /// Allocate and fill `len` bytes of seed material.
    pub fn generate_seed(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check_live()?;
        self.check_len(len)?;
        let mut seed = Vec::new();
        seed.try_reserve_exact(len).map_err(|_| Error::Memory(len))?;
        seed.resize(len, 0);
        self.generate(&mut seed)?;
        Ok(seed)
    }

    /// Mix `additional` input and fresh personalisation into the key.
    pub fn reseed(&mut self, additional: &[u8]) -> Result<()> {
        self.check_live()?;
        let resume = self.state;
        self.state = TrngState::Reseeding;
        let personalization = Personalization::gather(additional);
        let result = self.conditioner.reseed(personalization.as_bytes());
        self.state = resume;
        result?;
        self.stats.reseeds += 1;
        log::debug!("trng on {} reseeded", self.kind);
        Ok(())
    }

    /// Zero all secrets and release the source. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == TrngState::ShutDown {
            return;
        }
        self.conditioner.wipe();
        self.pool.wipe();
        self.duplicates.clear();
        self.source.cleanup();
        self.state = TrngState::ShutDown;
        log::debug!("trng on {} shut down", self.kind);
    }

    /// Whether the conditioner secrets are zero.
    pub fn is_wiped(&self) -> bool {
        self.conditioner.is_wiped()
    }

    pub fn health_report(&self) -> TrngReport {
        TrngReport {
            state: self.state,
            source: self.kind,
            guarantee_percent: self.pool.health.entropy_guarantee_percent,
            stats: self.stats,
            blocks_accepted: self.pool.health.accepted,
            blocks_rejected: self.pool.health.rejected,
            last_block_estimate: self.pool.health.last_estimate,
            estimator_entropy_percent: self
                .estimator
                .is_initialized()
                .then(|| self.estimator.entropy_percent()),
        }
    }
}

impl Drop for Trng {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn as_init_failure(err: Error) -> Error {
    match err {
        Error::InitializationFailure(_) => err,
        other => Error::InitializationFailure(other.to_string()),
    }
}
