//! CPU timer jitter: the primary, FIPS-eligible noise source.
//!
//! Pre-initialisation calibrates the counter (dead low bits) and tunes the
//! loop delay once per process; the result is shared by every instance built
//! from the same [`TimerPreinit`] handle. Each instance then owns its own
//! [`FilterState`] and pulls noise through the histogram filter.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::calibrate::{Calibration, Calibrator};
use crate::config::{Config, Limits, TunerKind};
use crate::counter::{CounterSource, HardwareCounter, spin_delay};
use crate::error::{Error, Result};
use crate::filter::{FilterState, NoiseFilter};
use crate::source::{NoiseSource, SourceInfo, SourceKind};
use crate::tune::{TuneOutcome, tune};

static TIMER_INFO: SourceInfo = SourceInfo {
    kind: SourceKind::Timer,
    name: "timer",
    description: "Histogram-filtered jitter between CPU counter reads across an idle loop",
    bits_needed: 2,
    fips_eligible: true,
};

/// Noise samples that must show a moving low bit before a fill is trusted.
const STUCK_CHECK_SAMPLES: usize = 64;

/// Outcome of the timer source's global pre-initialisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerTiming {
    pub calibration: Calibration,
    pub tune: TuneOutcome,
}

/// Shared handle to the process-wide timer calibration.
#[derive(Debug, Clone, Default)]
pub struct TimerPreinit(Arc<Mutex<Option<TimerTiming>>>);

impl TimerPreinit {
    fn slot(&self) -> MutexGuard<'_, Option<TimerTiming>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Option<TimerTiming> {
        *self.slot()
    }

    fn set(&self, timing: TimerTiming) {
        *self.slot() = Some(timing);
    }

    /// Forget the cached calibration so the next `preinit` redoes it.
    pub fn clear(&self) {
        *self.slot() = None;
    }
}

/// Timer-source settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct TimerSettings {
    pub shift: Option<u32>,
    pub loop_delay: Option<u32>,
    pub tuner: TunerKind,
    /// Low bits known to be dead on this platform.
    pub min_dead_bits: u32,
    pub limits: Limits,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TimerSettings {
    fn from(config: &Config) -> Self {
        Self {
            shift: config.shift,
            loop_delay: config.loop_delay,
            tuner: config.tuner,
            min_dead_bits: 0,
            limits: config.limits.clone(),
        }
    }
}

/// Timer jitter noise source.
pub struct TimerSource {
    counter: Box<dyn CounterSource>,
    settings: TimerSettings,
    preinit: TimerPreinit,
    filter: Option<FilterState>,
}

impl TimerSource {
    /// Timer source over the platform counter.
    pub fn new(settings: TimerSettings, preinit: TimerPreinit) -> Self {
        Self::with_counter(Box::new(HardwareCounter), settings, preinit)
    }

    /// Timer source over an arbitrary counter.
    pub fn with_counter(
        counter: Box<dyn CounterSource>,
        settings: TimerSettings,
        preinit: TimerPreinit,
    ) -> Self {
        Self {
            counter,
            settings,
            preinit,
            filter: None,
        }
    }

    /// Filter working set, once initialised.
    pub fn filter(&self) -> Option<&FilterState> {
        self.filter.as_ref()
    }

    fn calibrate(&mut self) -> Calibration {
        match self.settings.shift {
            Some(shift) => {
                log::info!("calibration bypassed: shift forced to {shift}");
                Calibration::forced(shift)
            }
            None => Calibrator::default().calibrate(self.counter.as_mut(), self.settings.min_dead_bits),
        }
    }
}

impl NoiseSource for TimerSource {
    fn info(&self) -> &SourceInfo {
        &TIMER_INFO
    }

    fn available(&mut self) -> bool {
        let a = self.counter.read();
        spin_delay(1_000);
        let b = self.counter.read();
        a != b
    }

    fn preinit(&mut self, force_reinit: bool) -> Result<()> {
        if !force_reinit && self.preinit.get().is_some() {
            return Ok(());
        }

        let calibration = self.calibrate();
        if !calibration.timer_ok {
            log::warn!("timer source: counter looks frozen, continuing with best-effort shift");
        }

        let mut probe = FilterState::new(calibration.shift, 1);
        let outcome = tune(
            &mut probe,
            self.counter.as_mut(),
            self.settings.tuner,
            self.settings.loop_delay,
        );
        self.preinit.set(TimerTiming {
            calibration,
            tune: outcome,
        });
        Ok(())
    }

    fn init(&mut self, _personalization: &[u8]) -> Result<()> {
        if self.preinit.get().is_none() {
            self.preinit(false)?;
        }
        let timing = self
            .preinit
            .get()
            .ok_or_else(|| Error::InitializationFailure("timer calibration missing".into()))?;

        let mut filter = FilterState::new(timing.calibration.shift, timing.tune.delay);
        filter.tuned = timing.tune.accepted;
        self.filter = Some(filter);
        log::debug!(
            "timer source initialised: shift={} delay={}",
            timing.calibration.shift,
            timing.tune.delay
        );
        Ok(())
    }

    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let filter = self
            .filter
            .as_mut()
            .ok_or_else(|| Error::InitializationFailure("timer source not initialised".into()))?;

        let mut filled = 0;
        let mut first: Option<u64> = None;
        let mut moving = 0u64;
        let mut seen = 0usize;
        while filled < buf.len() {
            NoiseFilter::gather_block(filter, self.counter.as_mut(), &self.settings.limits)?;
            for sample in filter.noise_samples() {
                let base = *first.get_or_insert(sample);
                moving |= sample ^ base;
                seen += 1;
            }
            for (dst, b) in buf[filled..].iter_mut().zip(filter.noise_bytes()) {
                *dst = b;
                filled += 1;
            }
        }

        if seen >= STUCK_CHECK_SAMPLES && moving & 1 == 0 {
            buf.fill(0);
            return Err(Error::ContinuousTestFailure(format!(
                "lowest sampled counter bit never changed across {seen} noise samples"
            )));
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut filter) = self.filter.take() {
            filter.reset();
        }
    }
}
