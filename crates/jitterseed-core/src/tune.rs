//! Loop-delay tuning.
//!
//! The number of idle iterations between two counter reads decides how much
//! jitter accumulates per sample. Both tuners sweep [`DELAY_PRIMES`] (primes
//! avoid locking onto a harmonic of some periodic system activity) and stop
//! at the first delay that looks noisy enough:
//!
//! - [`TunerKind::Heuristic`]: the LSB sequence of a burst must change state
//!   often, never sit still for long and be roughly balanced. After a hit the
//!   midpoint with the previous prime is tried, which is often just as good
//!   and faster.
//! - [`TunerKind::Entropy`]: a full filter pass must reach a min-entropy
//!   estimate of at least [`ENTROPY_TARGET_PERCENT`].
//!
//! A configured loop delay bypasses both.

use crate::config::TunerKind;
use crate::counter::{CounterSource, sample_burst};
use crate::filter::{FilterState, NoiseFilter};
use crate::health::min_entropy_percent;

/// Candidate loop delays, in sweep order.
pub const DELAY_PRIMES: [u32; 25] = [
    1, 2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
];

/// Samples per heuristic probe.
pub const TUNE_SAMPLES: usize = 256;

/// Minimum per-sample entropy estimate accepted by the entropy tuner.
pub const ENTROPY_TARGET_PERCENT: f64 = 50.0;

/// Longest tolerated run of an unchanged LSB.
const MAX_LSB_RUN: usize = 16;

/// Result of a tuning sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOutcome {
    pub delay: u32,
    /// `false` when no candidate qualified and the fallback was used.
    pub accepted: bool,
    /// `None` when the delay was forced by configuration.
    pub method: Option<TunerKind>,
    /// Entropy estimate of the accepted probe (entropy tuner only).
    pub estimate: Option<f64>,
}

/// Pick a loop delay for `state`'s counter.
pub fn tune(
    state: &mut FilterState,
    counter: &mut dyn CounterSource,
    kind: TunerKind,
    forced: Option<u32>,
) -> TuneOutcome {
    if let Some(delay) = forced {
        log::info!("tuning bypassed: loop delay forced to {delay}");
        state.loop_delay = delay.max(1);
        state.tuned = true;
        return TuneOutcome {
            delay: state.loop_delay,
            accepted: true,
            method: None,
            estimate: None,
        };
    }

    let outcome = match kind {
        TunerKind::Heuristic => heuristic_sweep(counter, state.shift),
        TunerKind::Entropy => entropy_sweep(state, counter),
    };
    if outcome.accepted {
        log::info!("tuned loop delay {} ({kind:?})", outcome.delay);
    } else {
        log::warn!(
            "no loop delay qualified ({kind:?}); falling back to {}",
            outcome.delay
        );
    }
    state.loop_delay = outcome.delay;
    state.tuned = outcome.accepted;
    outcome
}

/// Whether a burst's LSB sequence looks like noise.
pub fn lsb_sequence_ok(samples: &[u64]) -> bool {
    let n = samples.len();
    if n < 16 {
        return false;
    }
    let mut changes = 0usize;
    let mut run = 1usize;
    let mut longest = 1usize;
    let mut ones = (samples[0] & 1) as usize;
    for w in samples.windows(2) {
        let (a, b) = (w[0] & 1, w[1] & 1);
        ones += b as usize;
        if a != b {
            changes += 1;
            run = 1;
        } else {
            run += 1;
            longest = longest.max(run);
        }
    }
    changes >= n / 4 && longest <= MAX_LSB_RUN && (n * 3 / 8..=n * 5 / 8).contains(&ones)
}

fn probe(counter: &mut dyn CounterSource, shift: u32, delay: u32) -> bool {
    let mut samples = [0u64; TUNE_SAMPLES];
    sample_burst(counter, shift, delay, &mut samples);
    lsb_sequence_ok(&samples)
}

fn heuristic_sweep(counter: &mut dyn CounterSource, shift: u32) -> TuneOutcome {
    for (i, &delay) in DELAY_PRIMES.iter().enumerate() {
        if !probe(counter, shift, delay) {
            continue;
        }
        let mut chosen = delay;
        if i > 0 {
            let prev = DELAY_PRIMES[i - 1];
            let mid = (prev + delay) / 2;
            if mid > prev && mid < delay && probe(counter, shift, mid) {
                chosen = mid;
            }
        }
        return TuneOutcome {
            delay: chosen,
            accepted: true,
            method: Some(TunerKind::Heuristic),
            estimate: None,
        };
    }
    TuneOutcome {
        delay: DELAY_PRIMES[DELAY_PRIMES.len() - 1],
        accepted: false,
        method: Some(TunerKind::Heuristic),
        estimate: None,
    }
}

fn entropy_sweep(state: &mut FilterState, counter: &mut dyn CounterSource) -> TuneOutcome {
    let mut best: Option<(u32, f64)> = None;
    for &delay in &DELAY_PRIMES {
        state.loop_delay = delay;
        NoiseFilter::sample_pass(state, counter);
        let bytes: Vec<u8> = state.noise_bytes().collect();
        let estimate = if bytes.len() < 16 {
            0.0
        } else {
            min_entropy_percent(&bytes)
        };
        log::debug!("entropy tuner: delay {delay} -> {estimate:.1}% over {} samples", bytes.len());
        if estimate >= ENTROPY_TARGET_PERCENT {
            return TuneOutcome {
                delay,
                accepted: true,
                method: Some(TunerKind::Entropy),
                estimate: Some(estimate),
            };
        }
        if best.is_none_or(|(_, e)| estimate > e) {
            best = Some((delay, estimate));
        }
    }
    let (delay, estimate) = best.unwrap_or((DELAY_PRIMES[0], 0.0));
    TuneOutcome {
        delay,
        accepted: false,
        method: Some(TunerKind::Entropy),
        estimate: Some(estimate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jittery(seed: u64) -> impl FnMut() -> u64 + Send {
        let mut x = seed | 1;
        let mut t = 0u64;
        move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            t += 1 + x % 64;
            t
        }
    }

    #[test]
    fn forced_delay_bypasses_sweep() {
        let mut state = FilterState::new(0, 1);
        let mut counter = || -> u64 { panic!("counter must not be read") };
        let out = tune(&mut state, &mut counter, TunerKind::Entropy, Some(23));
        assert_eq!(out.delay, 23);
        assert_eq!(out.method, None);
        assert_eq!(state.loop_delay, 23);
        assert!(state.tuned);
    }

    #[test]
    fn lsb_checks() {
        let alternating: Vec<u64> = (0..256).collect();
        assert!(lsb_sequence_ok(&alternating));

        let stuck = vec![4u64; 256];
        assert!(!lsb_sequence_ok(&stuck));

        // Balanced but with long runs.
        let runs: Vec<u64> = (0..256u64).map(|i| (i / 32) & 1).collect();
        assert!(!lsb_sequence_ok(&runs));
    }

    #[test]
    fn heuristic_accepts_first_noisy_delay() {
        let mut state = FilterState::new(0, 1);
        let mut counter = jittery(99);
        let out = tune(&mut state, &mut counter, TunerKind::Heuristic, None);
        assert!(out.accepted);
        assert_eq!(out.delay, 1);
        assert!(state.tuned);
    }

    #[test]
    fn heuristic_falls_back_on_dead_counter() {
        let mut state = FilterState::new(0, 1);
        let mut counter = || 8u64;
        let out = tune(&mut state, &mut counter, TunerKind::Heuristic, None);
        assert!(!out.accepted);
        assert_eq!(out.delay, 89);
        assert!(!state.tuned);
    }

    #[test]
    fn entropy_tuner_accepts_noisy_counter() {
        let mut state = FilterState::new(0, 1);
        let mut counter = jittery(5);
        let out = tune(&mut state, &mut counter, TunerKind::Entropy, None);
        assert!(out.accepted);
        assert!(out.estimate.unwrap() >= ENTROPY_TARGET_PERCENT);
    }

    #[test]
    fn entropy_tuner_rejects_dead_counter() {
        let mut state = FilterState::new(0, 1);
        let mut counter = || 8u64;
        let out = tune(&mut state, &mut counter, TunerKind::Entropy, None);
        assert!(!out.accepted);
        assert_eq!(out.estimate, Some(0.0));
    }
}
