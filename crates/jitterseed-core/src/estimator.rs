//! Long-term entropy estimate from streaming compression.
//!
//! Every accepted output byte is pushed through a raw deflate stream that is
//! sync-flushed each [`FLUSH_INTERVAL`] input bytes. How far that chunk shrank
//! is recorded as the current compressibility. This is deliberately crude and
//! slow to react: it is a sanity check on the output over time, not a gate on
//! individual blocks (the health tests do that).
//!
//! [`EntropyEstimator::estimate`] reports compressibility in percent
//! (0 = incompressible, 100 = fully compressible), so a stuck generator drives
//! it towards 100. [`EntropyEstimator::entropy_percent`] is the inverse.

use std::io::Write;

use flate2::Compression;
use flate2::write::DeflateEncoder;

use crate::error::{Error, Result};

/// Input bytes between two measurements.
pub const FLUSH_INTERVAL: usize = 1024;

/// Bytes a sync flush adds on its own (empty stored block marker).
pub const FLUSH_OVERHEAD: u64 = 5;

/// Streaming compression-ratio estimator.
pub struct EntropyEstimator {
    encoder: DeflateEncoder<Vec<u8>>,
    pending: usize,
    bytes_in: u64,
    bytes_out: u64,
    estimate: u32,
    initialized: bool,
}

impl Default for EntropyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropyEstimator {
    pub fn new() -> Self {
        Self {
            encoder: DeflateEncoder::new(Vec::with_capacity(2 * FLUSH_INTERVAL), Compression::default()),
            pending: 0,
            bytes_in: 0,
            bytes_out: 0,
            estimate: 0,
            initialized: false,
        }
    }

    /// Stream `data` through the compressor, measuring at each interval.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (FLUSH_INTERVAL - self.pending).min(data.len());
            let (chunk, rest) = data.split_at(take);
            self.encoder.write_all(chunk).map_err(estimator_error)?;
            self.pending += take;
            self.bytes_in += take as u64;
            data = rest;

            if self.pending == FLUSH_INTERVAL {
                self.measure()?;
            }
        }
        Ok(())
    }

    fn measure(&mut self) -> Result<()> {
        self.encoder.flush().map_err(estimator_error)?;
        let produced = self.encoder.get_ref().len() as u64;
        self.encoder.get_mut().clear();
        self.bytes_out += produced;

        let payload = produced.saturating_sub(FLUSH_OVERHEAD);
        let ratio = (payload * 100 / FLUSH_INTERVAL as u64).min(100) as u32;
        self.estimate = 100 - ratio;
        self.pending = 0;
        self.initialized = true;
        log::debug!(
            "estimator: {FLUSH_INTERVAL} bytes -> {produced} compressed, compressibility {}%",
            self.estimate
        );
        Ok(())
    }

    /// Compressibility of the most recent interval; 0 before the first one.
    pub fn estimate(&self) -> u32 {
        self.estimate
    }

    /// Estimated entropy density in percent (inverse of [`Self::estimate`]).
    pub fn entropy_percent(&self) -> u32 {
        100 - self.estimate
    }

    /// Whether at least one interval has been measured.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Total bytes fed and compressed bytes produced.
    pub fn counters(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }

    /// `false` when the inverted estimate has fallen below
    /// `100 / design_guarantee` percent. Always `true` before the first
    /// measurement.
    pub fn entropy_ok(&self, design_guarantee: u32) -> bool {
        if !self.initialized {
            return true;
        }
        self.entropy_percent() >= 100 / design_guarantee.max(1)
    }
}

fn estimator_error(err: std::io::Error) -> Error {
    Error::EntropyInsufficient(format!("entropy estimator stream failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    #[test]
    fn zero_before_first_flush() {
        let mut est = EntropyEstimator::new();
        est.feed(&[7u8; FLUSH_INTERVAL - 1]).unwrap();
        assert_eq!(est.estimate(), 0);
        assert!(!est.is_initialized());
        assert!(est.entropy_ok(2));
    }

    #[test]
    fn constant_stream_is_compressible() {
        let mut est = EntropyEstimator::new();
        est.feed(&[0u8; 4 * FLUSH_INTERVAL]).unwrap();
        assert!(est.is_initialized());
        assert!(est.estimate() >= 95, "estimate {}", est.estimate());
        assert!(est.estimate() <= 100);
        assert!(!est.entropy_ok(2));
    }

    #[test]
    fn random_stream_is_incompressible() {
        let mut data = vec![0u8; 3 * FLUSH_INTERVAL];
        StdRng::seed_from_u64(42).fill_bytes(&mut data);
        let mut est = EntropyEstimator::new();
        est.feed(&data).unwrap();
        assert!(est.estimate() <= 5, "estimate {}", est.estimate());
        assert!(est.entropy_ok(2));
    }

    #[test]
    fn split_feeds_flush_at_interval() {
        let mut est = EntropyEstimator::new();
        for _ in 0..16 {
            est.feed(&[1u8; 63]).unwrap();
        }
        // 1008 bytes: no flush yet.
        assert!(!est.is_initialized());
        est.feed(&[1u8; 16]).unwrap();
        assert!(est.is_initialized());
        assert_eq!(est.counters().0, 1024);
    }

    #[test]
    fn collapse_after_good_history_trips() {
        let mut data = vec![0u8; 2 * FLUSH_INTERVAL];
        StdRng::seed_from_u64(1).fill_bytes(&mut data);
        let mut est = EntropyEstimator::new();
        est.feed(&data).unwrap();
        assert!(est.entropy_ok(2));
        est.feed(&[0xAA; FLUSH_INTERVAL]).unwrap();
        assert!(!est.entropy_ok(2));
    }
}
