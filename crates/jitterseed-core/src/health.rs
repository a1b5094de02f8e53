//! Online health tests over raw noise blocks (NIST SP 800-90B §4.4).
//!
//! Two independent tests run over every [`BLOCK_LEN`]-byte block before any of
//! it reaches the conditioner:
//!
//! - **Adaptive Proportion**: the count of the most frequent byte value must
//!   stay below a cutoff derived from the claimed entropy density.
//! - **Repeat Count**: no byte value may repeat consecutively as often as the
//!   claimed density makes implausible.
//!
//! A failing block is rejected outright. Blocks are never partially trusted.
//!
//! Cutoffs were computed for a window of 512 samples and a false-positive
//! rate of α = 2⁻²⁰, with H = guarantee × 8 bits per byte:
//! APT = 1 + CRITBINOM(512, 2⁻ᴴ, 1 − α), RCT = 1 + ⌈20 / H⌉.

use serde::Serialize;

/// Bytes per health-tested block.
pub const BLOCK_LEN: usize = 512;

/// Test cutoffs for one entropy guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cutoffs {
    pub guarantee_percent: u32,
    /// Most-common-value count at which the block fails.
    pub adaptive_proportion: u32,
    /// Consecutive-run length at which the block fails.
    pub repeat_count: u32,
}

const CUTOFF_TABLE: [Cutoffs; 4] = [
    Cutoffs {
        guarantee_percent: 25,
        adaptive_proportion: 177,
        repeat_count: 11,
    },
    Cutoffs {
        guarantee_percent: 50,
        adaptive_proportion: 62,
        repeat_count: 6,
    },
    Cutoffs {
        guarantee_percent: 75,
        adaptive_proportion: 25,
        repeat_count: 5,
    },
    Cutoffs {
        guarantee_percent: 100,
        adaptive_proportion: 13,
        repeat_count: 4,
    },
];

/// Cutoffs for `guarantee_percent`, rounded down to the nearest tabulated
/// guarantee (never below 25 %).
pub fn cutoffs(guarantee_percent: u32) -> Cutoffs {
    CUTOFF_TABLE
        .iter()
        .rev()
        .find(|c| c.guarantee_percent <= guarantee_percent)
        .copied()
        .unwrap_or(CUTOFF_TABLE[0])
}

/// Outcome of testing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    AdaptiveProportion { value: u8, count: u32, cutoff: u32 },
    RepeatCount { value: u8, run: u32, cutoff: u32 },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::AdaptiveProportion {
                value,
                count,
                cutoff,
            } => write!(
                f,
                "adaptive proportion: 0x{value:02x} occurred {count} times (cutoff {cutoff})"
            ),
            Verdict::RepeatCount { value, run, cutoff } => write!(
                f,
                "repeat count: 0x{value:02x} repeated {run} times (cutoff {cutoff})"
            ),
        }
    }
}

/// Stateless test engine.
pub struct HealthTestEngine;

impl HealthTestEngine {
    /// Run both tests over `block` at `guarantee_percent`.
    pub fn run(guarantee_percent: u32, block: &[u8]) -> Verdict {
        let c = cutoffs(guarantee_percent);

        let (value, count) = most_common(block);
        if count >= c.adaptive_proportion {
            return Verdict::AdaptiveProportion {
                value,
                count,
                cutoff: c.adaptive_proportion,
            };
        }

        let (value, run) = longest_run(block);
        if run >= c.repeat_count {
            return Verdict::RepeatCount {
                value,
                run,
                cutoff: c.repeat_count,
            };
        }

        Verdict::Pass
    }
}

/// Most frequent byte value and its count.
pub fn most_common(block: &[u8]) -> (u8, u32) {
    let mut counts = [0u32; 256];
    for &b in block {
        counts[b as usize] += 1;
    }
    let (value, count) = counts
        .iter()
        .enumerate()
        .max_by_key(|&(i, &c)| (c, std::cmp::Reverse(i)))
        .map(|(i, &c)| (i as u8, c))
        .unwrap_or((0, 0));
    (value, count)
}

/// Longest run of one repeated byte value.
pub fn longest_run(block: &[u8]) -> (u8, u32) {
    let Some(&first) = block.first() else {
        return (0, 0);
    };
    let (mut best_value, mut best) = (first, 1u32);
    let mut run = 1u32;
    for w in block.windows(2) {
        if w[0] == w[1] {
            run += 1;
            if run > best {
                best = run;
                best_value = w[1];
            }
        } else {
            run = 1;
        }
    }
    (best_value, best)
}

/// Min-entropy estimate of `block` as a percentage of 8 bits per byte.
pub fn min_entropy_percent(block: &[u8]) -> f64 {
    if block.is_empty() {
        return 0.0;
    }
    let (_, count) = most_common(block);
    let p_max = count as f64 / block.len() as f64;
    (-p_max.log2() / 8.0 * 100.0).clamp(0.0, 100.0)
}

/// Per-source health test bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct HealthTestState {
    pub id: u32,
    pub entropy_guarantee_percent: u32,
    /// Min-entropy estimate (percent) of the last accepted block.
    pub last_estimate: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub consecutive_failures: u32,
}

impl HealthTestState {
    pub fn new(id: u32, entropy_guarantee_percent: u32) -> Self {
        Self {
            id,
            entropy_guarantee_percent,
            last_estimate: 0.0,
            accepted: 0,
            rejected: 0,
            consecutive_failures: 0,
        }
    }

    /// Test one block and update the counters.
    pub fn check(&mut self, block: &[u8]) -> Verdict {
        let verdict = HealthTestEngine::run(self.entropy_guarantee_percent, block);
        if verdict.passed() {
            self.accepted += 1;
            self.consecutive_failures = 0;
            self.last_estimate = min_entropy_percent(block);
        } else {
            self.rejected += 1;
            self.consecutive_failures += 1;
            log::warn!(
                "health test {} rejected block ({} consecutive): {verdict}",
                self.id,
                self.consecutive_failures
            );
        }
        verdict
    }
}
