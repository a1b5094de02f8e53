//! NRBG supervisor: picks the next noise source after a fatal fault.
//!
//! The registry holds one slot per known source in failover order. On a
//! fault the supervisor decides, under a single lock:
//!
//! 1. The active source ran error-free for at least
//!    [`Limits::stable_window`](crate::config::Limits::stable_window): keep it
//!    and reinitialise it in place.
//! 2. Otherwise scan forward for the next available (and, if required,
//!    FIPS-eligible) source. A candidate used within
//!    [`Limits::min_reuse`](crate::config::Limits::min_reuse) means sources are
//!    flapping: disable the subsystem.
//! 3. No candidate at all: disable the subsystem.
//!
//! Disabling is permanent for the supervisor's lifetime. The lock is never
//! held across source I/O; callers rebuild the chosen source themselves.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::config::Config;
use crate::error::FaultKind;
use crate::source::{SourceDescriptor, SourceKind};

/// Registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
    /// When this source was last selected.
    pub last_used: Option<SystemTime>,
    /// Visited by the current failover scan. Cleared once a switch succeeds.
    pub tried: bool,
}

/// What the caller must do after reporting a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-run pre-initialisation and rebuild the same source.
    Reinitialize(SourceKind),
    /// Build `to` with forced pre-initialisation.
    Switched {
        from: Option<SourceKind>,
        to: SourceKind,
    },
    /// Unrecoverable; every later request must fail with this kind.
    Disabled(FaultKind),
}

/// Serialisable view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub active: Option<SourceKind>,
    pub disabled: Option<FaultKind>,
    pub require_fips: bool,
    pub slots: Vec<Slot>,
}

#[derive(Debug)]
struct Registry {
    slots: Vec<Slot>,
    active: Option<usize>,
    /// Start of the active source's current error-free run.
    healthy_since: Option<SystemTime>,
    disabled: Option<FaultKind>,
}

impl Registry {
    fn position(&self, kind: SourceKind) -> Option<usize> {
        self.slots.iter().position(|s| s.descriptor.kind == kind)
    }

    fn eligible(&self, idx: usize, require_fips: bool) -> bool {
        let d = &self.slots[idx].descriptor;
        d.available && (!require_fips || d.fips_eligible)
    }

    fn select(&mut self, idx: usize, now: SystemTime) {
        self.slots[idx].last_used = Some(now);
        self.active = Some(idx);
        self.healthy_since = Some(now);
    }

    fn active_kind(&self) -> Option<SourceKind> {
        self.active.map(|i| self.slots[i].descriptor.kind)
    }
}

/// Owner of the source registry and its lock.
#[derive(Debug)]
pub struct Supervisor {
    registry: Mutex<Registry>,
    require_fips: bool,
    stable_window: Duration,
    min_reuse: Duration,
}

impl Supervisor {
    pub fn new(descriptors: Vec<SourceDescriptor>, config: &Config) -> Self {
        Self::new_at(descriptors, config, SystemTime::now())
    }

    /// Construct with an explicit clock reading for the initial selection.
    pub fn new_at(descriptors: Vec<SourceDescriptor>, config: &Config, now: SystemTime) -> Self {
        let mut registry = Registry {
            slots: descriptors
                .into_iter()
                .map(|descriptor| Slot {
                    descriptor,
                    last_used: None,
                    tried: false,
                })
                .collect(),
            active: None,
            healthy_since: None,
            disabled: None,
        };

        let initial = match config.source {
            Some(kind) => {
                let idx = registry.position(kind);
                if idx.is_some_and(|i| !registry.eligible(i, config.require_fips)) {
                    log::warn!("forced source {kind} is not eligible here; using it anyway");
                }
                idx
            }
            None => (0..registry.slots.len()).find(|&i| registry.eligible(i, config.require_fips)),
        };
        match initial {
            Some(idx) => {
                registry.select(idx, now);
                log::info!("supervisor: initial source {}", registry.slots[idx].descriptor.kind);
            }
            None => {
                log::error!("supervisor: no usable noise source");
                registry.disabled = Some(FaultKind::Initialization);
            }
        }

        Self {
            registry: Mutex::new(registry),
            require_fips: config.require_fips,
            stable_window: config.limits.stable_window(),
            min_reuse: config.limits.min_reuse(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active(&self) -> Option<SourceKind> {
        self.lock().active_kind()
    }

    /// The fault that disabled the subsystem, if any.
    pub fn disabled(&self) -> Option<FaultKind> {
        self.lock().disabled
    }

    /// Record that `kind` was in use at `at`.
    pub fn mark_used(&self, kind: SourceKind, at: SystemTime) {
        let mut reg = self.lock();
        if let Some(idx) = reg.position(kind) {
            reg.slots[idx].last_used = Some(at);
        }
    }

    pub fn on_error(&self, fault: FaultKind) -> Decision {
        self.on_error_at(fault, SystemTime::now())
    }

    /// Decide how to recover from `fault` observed at `now`.
    pub fn on_error_at(&self, fault: FaultKind, now: SystemTime) -> Decision {
        let mut reg = self.lock();
        if let Some(kind) = reg.disabled {
            return Decision::Disabled(kind);
        }

        let from = reg.active_kind();
        if let (Some(idx), Some(since)) = (reg.active, reg.healthy_since) {
            let healthy_for = now.duration_since(since).unwrap_or(Duration::ZERO);
            if healthy_for >= self.stable_window {
                reg.select(idx, now);
                let kind = reg.slots[idx].descriptor.kind;
                log::info!(
                    "supervisor: {kind} ran {}s without error; reinitialising after {fault}",
                    healthy_for.as_secs()
                );
                return Decision::Reinitialize(kind);
            }
        }

        let n = reg.slots.len();
        let start = reg.active.map_or(0, |i| i + 1);
        let mut candidate = None;
        for i in (0..n).map(|step| (start + step) % n) {
            if Some(i) == reg.active {
                continue;
            }
            reg.slots[i].tried = true;
            if reg.eligible(i, self.require_fips) {
                candidate = Some(i);
                break;
            }
        }

        let Some(idx) = candidate else {
            log::error!("supervisor: no fallback source after {fault}; disabling");
            reg.active = None;
            reg.disabled = Some(fault);
            return Decision::Disabled(fault);
        };

        let kind = reg.slots[idx].descriptor.kind;
        if let Some(last) = reg.slots[idx].last_used {
            let idle = now.duration_since(last).unwrap_or(Duration::ZERO);
            if idle < self.min_reuse {
                log::error!(
                    "supervisor: fallback {kind} was used {}s ago; sources are flapping, disabling",
                    idle.as_secs()
                );
                reg.active = None;
                reg.disabled = Some(fault);
                return Decision::Disabled(fault);
            }
        }

        for slot in &mut reg.slots {
            slot.tried = false;
        }
        reg.select(idx, now);
        log::warn!(
            "supervisor: switching {} -> {kind} after {fault}",
            from.map_or("none", |k| k.name())
        );
        Decision::Switched { from, to: kind }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let reg = self.lock();
        SupervisorSnapshot {
            active: reg.active_kind(),
            disabled: reg.disabled,
            require_fips: self.require_fips,
            slots: reg.slots.clone(),
        }
    }

    /// Release the active source. Later faults find no fallback history.
    pub fn shutdown(&self) {
        let mut reg = self.lock();
        reg.active = None;
        reg.healthy_since = None;
        for slot in &mut reg.slots {
            slot.last_used = None;
            slot.tried = false;
        }
        if reg.disabled.is_none() {
            reg.disabled = Some(FaultKind::Initialization);
        }
        log::debug!("supervisor shut down");
    }
}
