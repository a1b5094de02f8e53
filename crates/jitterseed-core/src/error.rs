//! Error type shared by every stage of the seed pipeline.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a fatal fault, recorded when the subsystem is disabled so that
/// every later request can report the same status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FaultKind {
    /// Stuck-at bits or a repeated output.
    ContinuousTest,
    /// Health test or estimator rejection.
    EntropyInsufficient,
    /// No usable noise source.
    Initialization,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContinuousTest => write!(f, "continuous test failure"),
            Self::EntropyInsufficient => write!(f, "insufficient entropy"),
            Self::Initialization => write!(f, "initialization failure"),
        }
    }
}

/// Errors produced while harvesting, testing or conditioning entropy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Consecutive outputs were identical or the counter is stuck.
    #[error("continuous test failure: {0}")]
    ContinuousTestFailure(String),

    /// A health test or the long-term estimator rejected the noise.
    #[error("insufficient entropy: {0}")]
    EntropyInsufficient(String),

    /// The selected noise source could not be brought up.
    #[error("initialization failure: {0}")]
    InitializationFailure(String),

    /// Requested length is zero or above the configured maximum.
    #[error("invalid request size {requested} (allowed 1..={max})")]
    RequestSize { requested: usize, max: usize },

    /// An output buffer could not be allocated.
    #[error("out of memory allocating {0} bytes")]
    Memory(usize),

    /// The supervisor switched noise sources; self tests must be re-run.
    #[error("noise source switched to {0}; re-run self tests")]
    RestartAdvisory(String),

    /// The subsystem has been disabled after an unrecoverable fault.
    #[error("entropy subsystem disabled ({0})")]
    Disabled(FaultKind),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error must be escalated to the supervisor.
    pub fn is_fatal(&self) -> bool {
        self.fault_kind().is_some()
    }

    /// The fault category for escalating errors, `None` for local ones.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::ContinuousTestFailure(_) => Some(FaultKind::ContinuousTest),
            Self::EntropyInsufficient(_) => Some(FaultKind::EntropyInsufficient),
            Self::InitializationFailure(_) => Some(FaultKind::Initialization),
            Self::Disabled(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::Memory(0)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
