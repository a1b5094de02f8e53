//! Raw timing counters.
//!
//! Everything platform-specific about reading a cycle or timer counter lives
//! behind [`read_raw_counter`]. The calibrator, filter and tuner above this
//! module only ever see the [`CounterSource`] trait, which also lets tests
//! substitute synthetic counters.

// ---------------------------------------------------------------------------
// Platform counter reads
// ---------------------------------------------------------------------------

/// Read the CPU time-stamp counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_raw_counter() -> u64 {
    // SAFETY: RDTSC is unprivileged on every x86_64 OS we target and has no
    // memory side effects.
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

/// Read the ARM generic timer counter (CNTVCT_EL0).
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_raw_counter() -> u64 {
    let val: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on Linux and macOS. Read-only
    // system register, no side effects.
    unsafe {
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

/// Monotonic nanoseconds relative to a process-local epoch.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn read_raw_counter() -> u64 {
    monotonic_nanos()
}

/// Nanoseconds since the first call in this process.
pub fn monotonic_nanos() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Counter capability
// ---------------------------------------------------------------------------

/// A source of coarse, monotonic-ish counter values.
pub trait CounterSource: Send {
    /// Return the next raw counter value.
    fn read(&mut self) -> u64;
}

impl<F> CounterSource for F
where
    F: FnMut() -> u64 + Send,
{
    fn read(&mut self) -> u64 {
        self()
    }
}

/// The platform's native counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareCounter;

impl HardwareCounter {
    /// Whether reads come from a cycle-counter instruction rather than the
    /// monotonic clock fallback.
    pub fn is_native() -> bool {
        cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
    }
}

impl CounterSource for HardwareCounter {
    #[inline]
    fn read(&mut self) -> u64 {
        read_raw_counter()
    }
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Burn `iterations` idle loop iterations between two samples.
#[inline]
pub fn spin_delay(iterations: u32) {
    let mut acc = 0u32;
    for i in 0..iterations {
        acc = std::hint::black_box(acc.wrapping_add(i) ^ 0x5a5a);
    }
    std::hint::black_box(acc);
}

/// Fill `out` with counter readings shifted right by `shift`, separated by
/// `delay` idle iterations.
pub fn sample_burst(counter: &mut dyn CounterSource, shift: u32, delay: u32, out: &mut [u64]) {
    for slot in out.iter_mut() {
        spin_delay(delay);
        *slot = counter.read() >> shift.min(63);
    }
}

/// XOR-fold all 8 bytes of a `u64` into a single byte.
#[inline]
pub fn xor_fold_u64(v: u64) -> u8 {
    let b = v.to_le_bytes();
    b[0] ^ b[1] ^ b[2] ^ b[3] ^ b[4] ^ b[5] ^ b[6] ^ b[7]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_nanos_is_monotonic() {
        let t1 = monotonic_nanos();
        let t2 = monotonic_nanos();
        assert!(t2 >= t1);
    }

    #[test]
    fn closure_counter() {
        let mut n = 0u64;
        let mut counter = move || {
            n += 16;
            n
        };
        assert_eq!(CounterSource::read(&mut counter), 16);
        assert_eq!(CounterSource::read(&mut counter), 32);
    }

    #[test]
    fn sample_burst_applies_shift() {
        let mut n = 0u64;
        let mut counter = move || {
            n += 0x10;
            n
        };
        let mut out = [0u64; 4];
        sample_burst(&mut counter, 4, 0, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn xor_fold_identities() {
        assert_eq!(xor_fold_u64(0), 0);
        assert_eq!(xor_fold_u64(0xFF), 0xFF);
        assert_eq!(xor_fold_u64(0x0101010101010101), 0);
        assert_eq!(xor_fold_u64(0xBB_00_00_00_00_00_00_AA), 0xAA ^ 0xBB);
    }

    #[test]
    #[ignore] // Run with: cargo test -- --ignored
    fn hardware_counter_advances() {
        let mut counter = HardwareCounter;
        let a = counter.read();
        spin_delay(10_000);
        let b = counter.read();
        assert!(b > a, "counter did not advance: {a} -> {b}");
    }
}
