//! Concrete noise sources and the factory the NRBG builds them from.

pub mod hw_rng;
pub mod os_rng;
pub mod timer;

pub use hw_rng::HwRngSource;
pub use os_rng::OsRngSource;
pub use timer::{TimerPreinit, TimerSettings, TimerSource, TimerTiming};

use crate::config::Config;
use crate::source::{NoiseSource, SourceDescriptor, SourceKind, SourceProvider};

/// Builds the built-in sources. Timer instances share one calibration.
#[derive(Debug, Clone, Default)]
pub struct SourceFactory {
    config: Config,
    timer_preinit: TimerPreinit,
}

impl SourceFactory {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            timer_preinit: TimerPreinit::default(),
        }
    }

    /// Shared timer calibration, for diagnostics.
    pub fn timer_timing(&self) -> Option<TimerTiming> {
        self.timer_preinit.get()
    }

    fn make(&self, kind: SourceKind) -> Box<dyn NoiseSource> {
        match kind {
            SourceKind::Timer => Box::new(TimerSource::new(
                TimerSettings::from(&self.config),
                self.timer_preinit.clone(),
            )),
            SourceKind::OsRng => Box::new(OsRngSource::new()),
            SourceKind::HwRng => Box::new(HwRngSource::new()),
        }
    }
}

/// Construct a source of `kind` with default settings.
pub fn build_source(kind: SourceKind) -> Box<dyn NoiseSource> {
    SourceFactory::default().make(kind)
}

impl SourceProvider for SourceFactory {
    fn descriptors(&self) -> Vec<SourceDescriptor> {
        SourceKind::ALL
            .iter()
            .map(|&kind| {
                let mut source = self.make(kind);
                let available = source.available();
                let fips = source.info().fips_eligible;
                log::debug!("source {kind}: available={available} fips={fips}");
                SourceDescriptor::new(kind, available, fips)
            })
            .collect()
    }

    fn build(&self, kind: SourceKind) -> Option<Box<dyn NoiseSource>> {
        Some(self.make(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_cover_every_kind_in_order() {
        let factory = SourceFactory::default();
        let kinds: Vec<SourceKind> = factory.descriptors().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, SourceKind::ALL.to_vec());
    }

    #[test]
    fn os_rng_is_available_and_not_fips() {
        let factory = SourceFactory::default();
        let desc = factory
            .descriptors()
            .into_iter()
            .find(|d| d.kind == SourceKind::OsRng)
            .unwrap();
        assert!(desc.available);
        assert!(!desc.fips_eligible);
    }

    #[test]
    fn timer_timing_is_shared_across_builds() {
        let factory = SourceFactory::new(Config {
            shift: Some(2),
            loop_delay: Some(7),
            ..Config::default()
        });
        assert!(factory.timer_timing().is_none());

        let mut timer = factory.build(SourceKind::Timer).unwrap();
        timer.preinit(false).unwrap();
        let timing = factory.timer_timing().unwrap();
        assert_eq!(timing.calibration.shift, 2);
        assert_eq!(timing.tune.delay, 7);
        assert_eq!(timing.tune.method, None);

        // A second timer reuses the cached calibration.
        let mut again = factory.clone().build(SourceKind::Timer).unwrap();
        again.init(b"").unwrap();
        assert_eq!(factory.timer_timing(), Some(timing));
    }

    #[test]
    fn built_sources_match_kind() {
        for kind in SourceKind::ALL {
            assert_eq!(build_source(kind).info().kind, kind);
        }
    }
}
