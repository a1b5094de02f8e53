//! Supervisor-backed seed provider.
//!
//! [`Nrbg`] owns at most one live [`Trng`] on the supervisor's active
//! source. A fatal error tears the instance down and asks the
//! [`Supervisor`] what to do next; on a rebuild the self tests run again and
//! the caller gets [`Error::RestartAdvisory`] so it knows the source changed.
//! Once the supervisor disables the subsystem, every request fails fast.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, FaultKind, Result};
use crate::selftest;
use crate::source::{SourceKind, SourceProvider};
use crate::sources::SourceFactory;
use crate::supervisor::{Decision, Supervisor, SupervisorSnapshot};
use crate::trng::{Trng, TrngReport};

/// Non-deterministic random bit generator over a failover set of sources.
pub struct Nrbg {
    supervisor: Arc<Supervisor>,
    provider: Box<dyn SourceProvider>,
    config: Config,
    trng: Option<Trng>,
}

impl std::fmt::Debug for Nrbg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nrbg")
            .field("active", &self.supervisor.active())
            .field("trng", &self.trng)
            .finish_non_exhaustive()
    }
}

impl Nrbg {
    /// Provider over the built-in sources, configured from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let provider = SourceFactory::new(config.clone());
        let supervisor = Arc::new(Supervisor::new(provider.descriptors(), &config));
        Self::with_provider(config, Box::new(provider), supervisor)
    }

    /// Provider configured from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    /// Provider over caller-supplied sources and supervisor.
    pub fn with_provider(
        config: Config,
        provider: Box<dyn SourceProvider>,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self> {
        selftest::run_all()?;
        Ok(Self {
            supervisor,
            provider,
            config,
            trng: None,
        })
    }

    pub fn self_test(&self) -> Result<()> {
        selftest::run_all()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn active_source(&self) -> Option<SourceKind> {
        self.supervisor.active()
    }

    pub fn health_report(&self) -> Option<TrngReport> {
        self.trng.as_ref().map(Trng::health_report)
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.supervisor.snapshot()
    }

    fn build(&self, kind: SourceKind, force_preinit: bool) -> Result<Trng> {
        let source = self.provider.build(kind).ok_or_else(|| {
            Error::InitializationFailure(format!("no constructor for source {kind}"))
        })?;
        Trng::with_options(source, self.config.limits.clone(), force_preinit, &[])
    }

    fn live_trng(&mut self) -> Result<&mut Trng> {
        if self.trng.is_none() {
            let kind = self
                .supervisor
                .active()
                .ok_or(Error::Disabled(FaultKind::Initialization))?;
            let trng = self.build(kind, false)?;
            self.trng = Some(trng);
        }
        self.trng
            .as_mut()
            .ok_or_else(|| Error::InitializationFailure("trng missing".into()))
    }

    /// Return `len` bytes of conditioned seed material.
    pub fn generate_seed(&mut self, len: usize) -> Result<Vec<u8>> {
        if let Some(kind) = self.supervisor.disabled() {
            return Err(Error::Disabled(kind));
        }
        let max = self.config.limits.max_request;
        if len == 0 || len > max {
            return Err(Error::RequestSize { requested: len, max });
        }

        match self.live_trng().and_then(|trng| trng.generate_seed(len)) {
            Err(e) if e.is_fatal() => Err(self.recover(e)),
            other => other,
        }
    }

    /// Escalate a fatal error until a source comes up or the supervisor
    /// gives up. Terminates because every switch stamps the chosen slot.
    fn recover(&mut self, err: Error) -> Error {
        if let Some(mut trng) = self.trng.take() {
            trng.shutdown();
        }
        if let Error::Disabled(kind) = err {
            return Error::Disabled(kind);
        }

        let mut fault = err.fault_kind().unwrap_or(FaultKind::Initialization);
        log::error!("nrbg: escalating {err}");
        loop {
            let kind = match self.supervisor.on_error(fault) {
                Decision::Disabled(kind) => return Error::Disabled(kind),
                Decision::Reinitialize(kind) | Decision::Switched { to: kind, .. } => kind,
            };
            let rebuilt = self
                .build(kind, true)
                .and_then(|trng| selftest::run_all().map(|()| trng));
            match rebuilt {
                Ok(trng) => {
                    self.trng = Some(trng);
                    return Error::RestartAdvisory(kind.name().to_string());
                }
                Err(e) => {
                    log::warn!("nrbg: bringing up {kind} failed: {e}");
                    fault = e.fault_kind().unwrap_or(FaultKind::Initialization);
                }
            }
        }
    }

    /// Shut down the live TRNG, wiping its secrets.
    pub fn shutdown(&mut self) {
        if let Some(mut trng) = self.trng.take() {
            trng.shutdown();
        }
    }
}

impl Drop for Nrbg {
    fn drop(&mut self) {
        self.shutdown();
    }
}
