//! Integration tests for jitterseed-core.
//!
//! These tests drive the full seed pipeline:
//! source selection → TRNG bring-up → health tests → conditioning → failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use jitterseed_core::{
    Config, Error, FaultKind, HardwareCounter, NoiseSource, Nrbg, SourceDescriptor, SourceFactory,
    SourceInfo, SourceKind, SourceProvider, Supervisor, TimerSource, Trng,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static TIMER_STUB: SourceInfo = SourceInfo {
    kind: SourceKind::Timer,
    name: "timer",
    description: "scripted timer",
    bits_needed: 2,
    fips_eligible: true,
};
static OS_STUB: SourceInfo = SourceInfo {
    kind: SourceKind::OsRng,
    name: "os_rng",
    description: "scripted os rng",
    bits_needed: 1,
    fips_eligible: false,
};
static HW_STUB: SourceInfo = SourceInfo {
    kind: SourceKind::HwRng,
    name: "hw_rng",
    description: "scripted hw rng",
    bits_needed: 1,
    fips_eligible: false,
};

fn stub_info(kind: SourceKind) -> &'static SourceInfo {
    match kind {
        SourceKind::Timer => &TIMER_STUB,
        SourceKind::OsRng => &OS_STUB,
        SourceKind::HwRng => &HW_STUB,
    }
}

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Healthy(u64),
    Stuck,
    Missing,
}

struct ScriptedSource {
    info: &'static SourceInfo,
    behaviour: Behaviour,
    rng: StdRng,
    forced_preinits: Arc<AtomicUsize>,
}

impl NoiseSource for ScriptedSource {
    fn info(&self) -> &SourceInfo {
        self.info
    }
    fn available(&mut self) -> bool {
        !matches!(self.behaviour, Behaviour::Missing)
    }
    fn preinit(&mut self, force_reinit: bool) -> jitterseed_core::Result<()> {
        if force_reinit {
            self.forced_preinits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
    fn init(&mut self, _personalization: &[u8]) -> jitterseed_core::Result<()> {
        Ok(())
    }
    fn get_bytes(&mut self, buf: &mut [u8]) -> jitterseed_core::Result<()> {
        match self.behaviour {
            Behaviour::Stuck => buf.fill(0x42),
            _ => self.rng.fill_bytes(buf),
        }
        Ok(())
    }
    fn cleanup(&mut self) {}
}

/// Provider whose sources follow a per-kind script.
struct ScriptedProvider {
    script: HashMap<SourceKind, Behaviour>,
    forced_preinits: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    fn new(script: &[(SourceKind, Behaviour)]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            forced_preinits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn behaviour(&self, kind: SourceKind) -> Behaviour {
        self.script.get(&kind).copied().unwrap_or(Behaviour::Missing)
    }
}

impl SourceProvider for ScriptedProvider {
    fn descriptors(&self) -> Vec<SourceDescriptor> {
        SourceKind::ALL
            .iter()
            .map(|&kind| {
                let available = !matches!(self.behaviour(kind), Behaviour::Missing);
                SourceDescriptor::new(kind, available, stub_info(kind).fips_eligible)
            })
            .collect()
    }

    fn build(&self, kind: SourceKind) -> Option<Box<dyn NoiseSource>> {
        let behaviour = self.behaviour(kind);
        let seed = match behaviour {
            Behaviour::Healthy(seed) => seed,
            _ => 0,
        };
        Some(Box::new(ScriptedSource {
            info: stub_info(kind),
            behaviour,
            rng: StdRng::seed_from_u64(seed),
            forced_preinits: self.forced_preinits.clone(),
        }))
    }
}

fn nrbg_with(provider: ScriptedProvider, config: Config) -> Nrbg {
    let supervisor = Arc::new(Supervisor::new(provider.descriptors(), &config));
    Nrbg::with_provider(config, Box::new(provider), supervisor).unwrap()
}

#[test]
fn healthy_source_serves_exact_lengths() {
    init_logging();
    let provider = ScriptedProvider::new(&[(SourceKind::Timer, Behaviour::Healthy(1))]);
    let mut nrbg = nrbg_with(provider, Config::default());
    assert_eq!(nrbg.active_source(), Some(SourceKind::Timer));

    let mut previous = Vec::new();
    for len in [1, 31, 32, 33, 64, 1000] {
        let seed = nrbg.generate_seed(len).unwrap();
        assert_eq!(seed.len(), len);
        assert_ne!(seed, previous);
        previous = seed;
    }
    let report = nrbg.health_report().unwrap();
    assert_eq!(report.source, SourceKind::Timer);
    assert_eq!(report.blocks_rejected, 0);
}

#[test]
fn stuck_timer_fails_over_with_restart_advisory() {
    init_logging();
    let provider = ScriptedProvider::new(&[
        (SourceKind::Timer, Behaviour::Stuck),
        (SourceKind::OsRng, Behaviour::Healthy(7)),
    ]);
    let forced = provider.forced_preinits.clone();
    let mut nrbg = nrbg_with(provider, Config::default());

    let err = nrbg.generate_seed(32).unwrap_err();
    assert_eq!(err, Error::RestartAdvisory("os_rng".into()));
    assert_eq!(nrbg.active_source(), Some(SourceKind::OsRng));
    assert_eq!(forced.load(Ordering::SeqCst), 1);

    let seed = nrbg.generate_seed(32).unwrap();
    assert_eq!(seed.len(), 32);
}

#[test]
fn flapping_sources_disable_permanently() {
    init_logging();
    let provider = ScriptedProvider::new(&[
        (SourceKind::Timer, Behaviour::Stuck),
        (SourceKind::OsRng, Behaviour::Stuck),
    ]);
    let mut nrbg = nrbg_with(provider, Config::default());

    assert!(matches!(
        nrbg.generate_seed(16),
        Err(Error::RestartAdvisory(_))
    ));
    let fatal = nrbg.generate_seed(16).unwrap_err();
    assert_eq!(fatal, Error::Disabled(FaultKind::EntropyInsufficient));

    for len in [1, 16, 4096] {
        assert_eq!(nrbg.generate_seed(len).unwrap_err(), fatal);
    }
    assert!(nrbg.health_report().is_none());
}

#[test]
fn unavailable_forced_source_escalates() {
    init_logging();
    let provider = ScriptedProvider::new(&[(SourceKind::OsRng, Behaviour::Healthy(3))]);
    let config = Config {
        source: Some(SourceKind::HwRng),
        ..Config::default()
    };
    let mut nrbg = nrbg_with(provider, config);
    assert_eq!(nrbg.active_source(), Some(SourceKind::HwRng));

    // hw_rng cannot come up; the scan wraps past the missing timer to os_rng.
    assert_eq!(
        nrbg.generate_seed(8).unwrap_err(),
        Error::RestartAdvisory("os_rng".into())
    );
    assert_eq!(nrbg.generate_seed(8).unwrap().len(), 8);
}

#[test]
fn request_size_is_local_error() {
    init_logging();
    let provider = ScriptedProvider::new(&[(SourceKind::Timer, Behaviour::Healthy(5))]);
    let mut nrbg = nrbg_with(provider, Config::default());
    assert!(matches!(
        nrbg.generate_seed(0),
        Err(Error::RequestSize { .. })
    ));
    assert!(matches!(
        nrbg.generate_seed(1 << 20),
        Err(Error::RequestSize { .. })
    ));
    assert_eq!(nrbg.active_source(), Some(SourceKind::Timer));
    assert!(nrbg.supervisor().disabled().is_none());
}

#[test]
fn supervisor_snapshot_reflects_failover() {
    init_logging();
    let provider = ScriptedProvider::new(&[
        (SourceKind::Timer, Behaviour::Stuck),
        (SourceKind::OsRng, Behaviour::Healthy(11)),
    ]);
    let mut nrbg = nrbg_with(provider, Config::default());
    let _ = nrbg.generate_seed(32);
    let snapshot = nrbg.snapshot();
    assert_eq!(snapshot.active, Some(SourceKind::OsRng));
    assert!(snapshot.slots.iter().all(|s| s.descriptor.kind != SourceKind::HwRng
        || s.last_used.is_none()));
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"active\":\"os_rng\""));
}

#[test]
fn os_rng_pipeline_end_to_end() {
    init_logging();
    let config = Config {
        source: Some(SourceKind::OsRng),
        ..Config::default()
    };
    let mut nrbg = Nrbg::new(config).unwrap();
    let a = nrbg.generate_seed(64).unwrap();
    let b = nrbg.generate_seed(64).unwrap();
    assert_ne!(a, b);
    nrbg.shutdown();
    assert!(nrbg.health_report().is_none());
}

#[test]
fn trng_over_os_rng_reports_health() {
    init_logging();
    let factory = SourceFactory::default();
    let source = factory.build(SourceKind::OsRng).unwrap();
    let mut trng = Trng::new(source, Default::default()).unwrap();
    trng.generate_seed(2048).unwrap();
    let report = trng.health_report();
    assert_eq!(report.guarantee_percent, 100);
    assert!(report.blocks_accepted >= 4);
    assert!(report.estimator_entropy_percent.unwrap() >= 50);
}

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn timer_source_on_real_hardware() {
    init_logging();
    println!("native counter: {}", HardwareCounter::is_native());
    let mut source = TimerSource::new(Default::default(), Default::default());
    assert!(source.available());
    let mut trng = Trng::new(Box::new(source), Default::default()).unwrap();
    for _ in 0..4 {
        assert_eq!(trng.generate_seed(64).unwrap().len(), 64);
    }
    let report = trng.health_report();
    assert_eq!(report.guarantee_percent, 50);
    println!("{}", serde_json::to_string_pretty(&report).unwrap());
}

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn default_nrbg_on_real_hardware() {
    init_logging();
    let mut nrbg = Nrbg::new(Config::default()).unwrap();
    match nrbg.generate_seed(48) {
        Ok(seed) => assert_eq!(seed.len(), 48),
        Err(Error::RestartAdvisory(to)) => {
            println!("failed over to {to}");
            assert_eq!(nrbg.generate_seed(48).unwrap().len(), 48);
        }
        Err(e) => panic!("unexpected error: {e}"),
    }
}
