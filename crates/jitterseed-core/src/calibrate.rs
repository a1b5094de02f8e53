//! Counter calibration: how many low bits of the raw counter to discard.
//!
//! Some counters have stuck low bits (a timebase that advances in fixed
//! strides) or bits that only move weakly. Sampling those would feed constant
//! bits into the filter, so the calibrator measures which bits actually toggle
//! and picks the lowest trustworthy one.
//!
//! The procedure per round:
//!
//! 1. read a batch of [`CALIBRATION_SAMPLES`] counter values back to back;
//! 2. XOR samples paired from opposite ends of the batch (and adjacent
//!    samples) to build a mask of bits that ever changed;
//! 3. choose the lowest bit at or above the known-dead floor that changed
//!    together with its upper neighbour, so a single flaky bit is ignored;
//! 4. cap the result by `shift_max`, derived from the mean stride between
//!    consecutive reads, so beat effects between an async timebase and the
//!    instruction clock cannot make us discard all variation.
//!
//! Several rounds are run and the modal shift wins. A final validation pass
//! bins [`VALIDATION_BLOCKS`] blocks of readings by bit position and bumps the
//! shift once if any examined bit is badly biased.

use crate::counter::CounterSource;

/// Readings per calibration batch.
pub const CALIBRATION_SAMPLES: usize = 512;
/// Independent rounds whose modal shift is used.
pub const CALIBRATION_ROUNDS: usize = 5;
/// Blocks of [`CALIBRATION_SAMPLES`] re-sampled by the validation pass.
pub const VALIDATION_BLOCKS: usize = 64;
/// Low bits (after shifting) examined for bias by the validation pass.
pub const VALIDATION_BITS: u32 = 8;

/// Outcome of calibrating a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// Number of low bits to discard from each raw reading.
    pub shift: u32,
    /// Largest shift that still keeps per-read variation.
    pub shift_max: u32,
    /// Mean counter increment between two consecutive reads.
    pub mean_stride: u64,
    /// `false` when a batch of reads never changed value.
    pub timer_ok: bool,
    /// `false` when the validation pass had to bump the shift.
    pub validated: bool,
}

impl Calibration {
    /// Calibration result for a caller-forced shift.
    pub fn forced(shift: u32) -> Self {
        Self {
            shift,
            shift_max: shift,
            mean_stride: 0,
            timer_ok: true,
            validated: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Round {
    shift: u32,
    shift_max: u32,
    stride: u64,
    constant: bool,
}

/// Counter calibrator.
#[derive(Debug, Clone)]
pub struct Calibrator {
    rounds: usize,
    validation_blocks: usize,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self {
            rounds: CALIBRATION_ROUNDS,
            validation_blocks: VALIDATION_BLOCKS,
        }
    }
}

impl Calibrator {
    pub fn new(rounds: usize, validation_blocks: usize) -> Self {
        Self {
            rounds: rounds.max(1),
            validation_blocks,
        }
    }

    /// Determine the discard shift for `counter`.
    ///
    /// Never fails: a dead counter yields `timer_ok = false` and a best-effort
    /// shift, and the fault surfaces later through the health tests.
    pub fn calibrate(&self, counter: &mut dyn CounterSource, min_dead_bits: u32) -> Calibration {
        let min_dead_bits = min_dead_bits.min(62);
        let rounds: Vec<Round> = (0..self.rounds)
            .map(|_| calibration_round(counter, min_dead_bits))
            .collect();

        let timer_ok = rounds.iter().all(|r| !r.constant);
        let shift_max = rounds.iter().map(|r| r.shift_max).max().unwrap_or(min_dead_bits);
        let mean_stride = rounds.iter().map(|r| r.stride).sum::<u64>() / rounds.len() as u64;
        let mut shift = modal_shift(&rounds).unwrap_or(min_dead_bits);

        if !timer_ok {
            log::warn!("counter did not advance during calibration; using shift {shift}");
            return Calibration {
                shift,
                shift_max,
                mean_stride,
                timer_ok,
                validated: false,
            };
        }

        let validated = self.validate(counter, shift);
        if !validated && shift < 63 {
            shift += 1;
            log::info!("calibration: biased low bits, shift raised to {shift}");
        }

        log::info!(
            "calibration: shift={shift} shift_max={shift_max} stride={mean_stride} validated={validated}"
        );
        Calibration {
            shift,
            shift_max,
            mean_stride,
            timer_ok,
            validated,
        }
    }

    /// Re-sample at `shift` and check that every examined bit is set in
    /// 25 %..=75 % of readings.
    fn validate(&self, counter: &mut dyn CounterSource, shift: u32) -> bool {
        if self.validation_blocks == 0 {
            return true;
        }
        let mut set_counts = [0u64; VALIDATION_BITS as usize];
        let mut buf = [0u64; CALIBRATION_SAMPLES];
        for _ in 0..self.validation_blocks {
            for slot in buf.iter_mut() {
                *slot = counter.read() >> shift;
            }
            for &v in &buf {
                for (bit, count) in set_counts.iter_mut().enumerate() {
                    *count += (v >> bit) & 1;
                }
            }
        }
        let total = (self.validation_blocks * CALIBRATION_SAMPLES) as u64;
        let (lo, hi) = (total / 4, total - total / 4);
        set_counts.iter().enumerate().all(|(bit, &count)| {
            let ok = (lo..=hi).contains(&count);
            if !ok {
                log::debug!("calibration: bit {bit} set in {count}/{total} readings");
            }
            ok
        })
    }
}

/// Mask of bits that changed anywhere in `samples`.
fn changed_bits(samples: &[u64]) -> u64 {
    let n = samples.len();
    let ends = (0..n / 2).fold(0u64, |m, i| m | (samples[i] ^ samples[n - 1 - i]));
    samples.windows(2).fold(ends, |m, w| m | (w[0] ^ w[1]))
}

/// Floor of log2 of the mean stride: the most bits that can be discarded
/// while consecutive reads still differ on average.
fn stride_limit(stride: u64) -> u32 {
    if stride < 2 { 0 } else { 63 - stride.leading_zeros() }
}

fn calibration_round(counter: &mut dyn CounterSource, min_dead_bits: u32) -> Round {
    let mut samples = [0u64; CALIBRATION_SAMPLES];
    for slot in samples.iter_mut() {
        *slot = counter.read();
    }

    let mask = changed_bits(&samples);
    let constant = mask == 0;
    let stride = samples[CALIBRATION_SAMPLES - 1].wrapping_sub(samples[0])
        / (CALIBRATION_SAMPLES as u64 - 1);
    let shift_max = stride_limit(stride).max(min_dead_bits);

    let paired = (min_dead_bits..63).find(|&bit| (mask >> bit) & 0b11 == 0b11);
    let shift = paired.unwrap_or(min_dead_bits).min(shift_max);

    Round {
        shift,
        shift_max,
        stride,
        constant,
    }
}

/// Most frequent shift across rounds; ties go to the smaller shift.
fn modal_shift(rounds: &[Round]) -> Option<u32> {
    let mut counts = [0usize; 64];
    for r in rounds {
        counts[r.shift as usize] += 1;
    }
    let best = *counts.iter().max()?;
    if best == 0 {
        return None;
    }
    counts.iter().position(|&c| c == best).map(|s| s as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stepping(step: u64) -> impl FnMut() -> u64 + Send {
        let mut n = 0u64;
        move || {
            n = n.wrapping_add(step);
            n
        }
    }

    #[test]
    fn dead_low_bits_are_discarded() {
        // Low 4 bits always zero, bit 4 toggles every read.
        let mut counter = stepping(16);
        let cal = Calibrator::default().calibrate(&mut counter, 0);
        assert!(cal.shift >= 4, "shift {} should skip dead bits", cal.shift);
        assert!(cal.timer_ok);
        assert_eq!(cal.mean_stride, 16);
    }

    #[test]
    fn unit_stride_counter_keeps_all_bits() {
        let mut counter = stepping(1);
        let cal = Calibrator::default().calibrate(&mut counter, 0);
        assert_eq!(cal.shift, 0);
        assert_eq!(cal.shift_max, 0);
        assert!(cal.validated);
    }

    #[test]
    fn known_dead_floor_is_respected() {
        let mut counter = stepping(1);
        let cal = Calibrator::default().calibrate(&mut counter, 3);
        assert!(cal.shift >= 3);
    }

    #[test]
    fn frozen_counter_is_flagged_but_calibrates() {
        let mut counter = || 0xdead_beef_u64;
        let cal = Calibrator::default().calibrate(&mut counter, 2);
        assert!(!cal.timer_ok);
        assert_eq!(cal.shift, 2);
    }

    #[test]
    fn single_flaky_bit_is_not_trusted() {
        // Only bit 0 flickers; real motion starts at bit 8 and the stride
        // limit caps the shift just below it.
        let mut n = 0u64;
        let mut counter = move || {
            n += 1;
            (n << 8) | (n & 1)
        };
        let cal = Calibrator::new(3, 0).calibrate(&mut counter, 0);
        assert_eq!(cal.shift_max, 7);
        assert_eq!(cal.shift, 7, "shift {} trusted an isolated bit", cal.shift);
    }

    #[test]
    fn biased_bits_bump_shift() {
        // After shifting, bit 0 is set in 7 of 8 reads.
        let mut n = 0u64;
        let mut counter = move || {
            n += 1;
            let low = if n % 8 == 0 { 0 } else { 1 };
            (n << 1) | low
        };
        let cal = Calibrator::default();
        assert!(!cal.validate(&mut counter, 0));
    }

    #[test]
    fn modal_shift_prefers_smaller_on_tie() {
        let mk = |shift| Round {
            shift,
            shift_max: 8,
            stride: 1,
            constant: false,
        };
        assert_eq!(modal_shift(&[mk(3), mk(2), mk(3), mk(2)]), Some(2));
        assert_eq!(modal_shift(&[mk(5), mk(2), mk(5)]), Some(5));
    }

    #[test]
    fn stride_limit_is_floor_log2() {
        assert_eq!(stride_limit(0), 0);
        assert_eq!(stride_limit(1), 0);
        assert_eq!(stride_limit(16), 4);
        assert_eq!(stride_limit(31), 4);
        assert_eq!(stride_limit(32), 5);
    }
}
