//! Histogram high-pass filter isolating timing noise.
//!
//! A burst of counter samples taken at a fixed loop delay is dominated by the
//! sampling cadence itself: most inter-sample deltas fall into one or two
//! values set by the loop and the clock ratio. Those are synchronisation
//! artefacts, not noise. The filter keeps only the rare deltas.
//!
//! ```text
//! burst (256 samples) → deltas → histogram → sort by frequency
//!     → drop 2 dominant buckets, drop buckets ≥ cap → restore arrival order
//! ```
//!
//! When too few buckets survive the loop delay is grown by half and the burst
//! repeated; every [`Limits::filter_halve_after`] failures the delay is halved
//! instead, which recovers when the CPU clock was scaled down under us.

use crate::config::Limits;
use crate::counter::{CounterSource, sample_burst, xor_fold_u64};
use crate::error::{Error, Result};

/// Samples per burst.
pub const BURST_LEN: usize = 256;
/// Raw values stored per histogram bucket (K).
pub const BUCKET_CAP: usize = 16;
/// Deltas below this are counted as too-short intervals and never bucketed.
pub const MIN_DELTA: u64 = 2;
/// Highest-frequency buckets always discarded.
pub const DOMINANT_BUCKETS: usize = 2;
/// Upper bound on the loop delay reached by escalation.
pub const MAX_LOOP_DELAY: u32 = 1 << 20;

const HISTOGRAM_SLOTS: usize = BURST_LEN - 1;

/// One delta value and the samples that produced it.
#[derive(Debug, Clone, Copy)]
pub struct DeltaHistogramEntry {
    pub delta: u64,
    pub frequency: u32,
    /// `(arrival index, sample)` pairs, first `stored` are valid.
    values: [(u16, u64); BUCKET_CAP],
    stored: u8,
}

impl DeltaHistogramEntry {
    const EMPTY: Self = Self {
        delta: 0,
        frequency: 0,
        values: [(0, 0); BUCKET_CAP],
        stored: 0,
    };

    fn new(delta: u64) -> Self {
        Self {
            delta,
            ..Self::EMPTY
        }
    }

    fn record(&mut self, arrival: u16, sample: u64) {
        self.frequency += 1;
        if (self.stored as usize) < BUCKET_CAP {
            self.values[self.stored as usize] = (arrival, sample);
            self.stored += 1;
        }
    }

    /// Stored `(arrival, sample)` pairs.
    pub fn values(&self) -> &[(u16, u64)] {
        &self.values[..self.stored as usize]
    }
}

/// Fixed-capacity delta histogram in first-seen order.
#[derive(Debug, Clone)]
pub struct DeltaHistogram {
    entries: Box<[DeltaHistogramEntry]>,
    len: usize,
}

impl Default for DeltaHistogram {
    fn default() -> Self {
        Self {
            entries: vec![DeltaHistogramEntry::EMPTY; HISTOGRAM_SLOTS].into_boxed_slice(),
            len: 0,
        }
    }
}

impl DeltaHistogram {
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entries(&self) -> &[DeltaHistogramEntry] {
        &self.entries[..self.len]
    }

    /// Count `delta`, keeping `sample` if the bucket still has room.
    pub fn insert(&mut self, delta: u64, arrival: u16, sample: u64) {
        if let Some(entry) = self.entries[..self.len].iter_mut().find(|e| e.delta == delta) {
            entry.record(arrival, sample);
            return;
        }
        if self.len == self.entries.len() {
            return;
        }
        let mut entry = DeltaHistogramEntry::new(delta);
        entry.record(arrival, sample);
        self.entries[self.len] = entry;
        self.len += 1;
    }

    /// Stable sort by descending frequency.
    pub fn sort_by_frequency(&mut self) {
        self.entries[..self.len].sort_by(|a, b| b.frequency.cmp(&a.frequency));
    }
}

/// Diagnostic counters for one filter instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FilterStats {
    pub bursts: u64,
    pub failed_bursts: u64,
    pub delay_increases: u64,
    pub delay_halvings: u64,
    pub short_deltas: u64,
    pub zero_deltas: u64,
}

/// Working set of one noise-source instance.
#[derive(Debug, Clone)]
pub struct FilterState {
    histogram: DeltaHistogram,
    burst: Vec<u64>,
    samples: Vec<(u16, u64)>,
    pub shift: u32,
    pub loop_delay: u32,
    pub tuned: bool,
    stats: FilterStats,
}

impl FilterState {
    pub fn new(shift: u32, loop_delay: u32) -> Self {
        Self {
            histogram: DeltaHistogram::default(),
            burst: vec![0u64; BURST_LEN],
            samples: Vec::with_capacity(BURST_LEN),
            shift,
            loop_delay: loop_delay.max(1),
            tuned: false,
            stats: FilterStats::default(),
        }
    }

    /// Reset all working data, keeping calibration.
    pub fn reset(&mut self) {
        self.histogram.clear();
        self.burst.fill(0);
        self.samples.clear();
        self.stats = FilterStats::default();
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn histogram(&self) -> &DeltaHistogram {
        &self.histogram
    }

    /// Noise samples from the last successful pass, in arrival order.
    pub fn noise_samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().map(|&(_, v)| v)
    }

    /// One byte per noise sample.
    pub fn noise_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.noise_samples().map(xor_fold_u64)
    }
}

/// Histogram filter operations.
pub struct NoiseFilter;

impl NoiseFilter {
    /// Take one burst at the current delay and filter it.
    ///
    /// Returns the number of surviving buckets; the surviving samples are
    /// left in the state in arrival order.
    pub fn sample_pass(state: &mut FilterState, counter: &mut dyn CounterSource) -> usize {
        sample_burst(counter, state.shift, state.loop_delay, &mut state.burst);
        state.stats.bursts += 1;
        state.histogram.clear();

        for (i, w) in state.burst.windows(2).enumerate() {
            let delta = w[1].wrapping_sub(w[0]);
            if delta < MIN_DELTA {
                state.stats.short_deltas += 1;
                if delta == 0 {
                    state.stats.zero_deltas += 1;
                }
                continue;
            }
            state.histogram.insert(delta, (i + 1) as u16, w[1]);
        }
        state.histogram.sort_by_frequency();

        state.samples.clear();
        let mut buckets = 0;
        for entry in state.histogram.entries().iter().skip(DOMINANT_BUCKETS) {
            if entry.frequency as usize >= BUCKET_CAP {
                continue;
            }
            buckets += 1;
            state.samples.extend_from_slice(entry.values());
        }
        state.samples.sort_unstable_by_key(|&(arrival, _)| arrival);
        buckets
    }

    /// Gather one block of noise samples, escalating the loop delay until at
    /// least `limits.min_buckets` buckets survive.
    ///
    /// Returns the bucket count of the accepted pass; the samples are read
    /// back with [`FilterState::noise_samples`].
    pub fn gather_block(
        state: &mut FilterState,
        counter: &mut dyn CounterSource,
        limits: &Limits,
    ) -> Result<usize> {
        let halve_after = limits.filter_halve_after.max(1);
        let mut failures = 0u32;
        loop {
            let buckets = Self::sample_pass(state, counter);
            if buckets >= limits.min_buckets {
                log::debug!(
                    "filter: {buckets} buckets, {} samples at delay {}",
                    state.samples.len(),
                    state.loop_delay
                );
                return Ok(buckets);
            }

            state.samples.clear();
            state.stats.failed_bursts += 1;
            failures += 1;
            if failures >= limits.max_filter_failures {
                log::warn!(
                    "filter: gave up after {failures} bursts below {} buckets",
                    limits.min_buckets
                );
                return Err(Error::EntropyInsufficient(format!(
                    "noise filter found fewer than {} buckets in {failures} bursts",
                    limits.min_buckets
                )));
            }

            if failures % halve_after == 0 {
                state.loop_delay = (state.loop_delay / 2).max(1);
                state.stats.delay_halvings += 1;
                log::debug!("filter: halving loop delay to {}", state.loop_delay);
            } else {
                state.loop_delay = state
                    .loop_delay
                    .saturating_add(state.loop_delay / 2 + 1)
                    .min(MAX_LOOP_DELAY);
                state.stats.delay_increases += 1;
            }
        }
    }
}
