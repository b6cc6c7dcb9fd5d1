use std::time::Duration;
use thiserror::Error;

/// Errors raised by the worker lifecycle: construction, registration,
/// start and shutdown.
///
/// Failures inside a single check cycle are not lifecycle errors; they are
/// reported through [`CycleError`](super::CycleError) on the result stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// A periodic worker was configured with a zero interval.
    #[error("worker interval must be strictly positive")]
    InvalidInterval,

    /// A periodic worker was configured with a zero per-cycle deadline.
    #[error("worker cycle timeout must be strictly positive")]
    InvalidCycleTimeout,

    /// `register` was called after the manager left the `Created` state.
    #[error("cannot register workers once the manager has been started")]
    RegistryFrozen,

    /// A worker with the same name is already registered.
    #[error("a worker named '{0}' is already registered")]
    DuplicateWorker(String),

    /// `start` was called more than once.
    #[error("worker manager has already been started")]
    AlreadyStarted,

    /// Shutdown gave up waiting; the listed workers may still be running.
    #[error("shutdown timed out after {timeout:?}; still running: {stuck:?}")]
    ShutdownTimeout {
        timeout: Duration,
        stuck: Vec<String>,
    },
}

impl WorkerError {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::InvalidInterval => "invalid_interval",
            WorkerError::InvalidCycleTimeout => "invalid_cycle_timeout",
            WorkerError::RegistryFrozen => "registry_frozen",
            WorkerError::DuplicateWorker(_) => "duplicate_worker",
            WorkerError::AlreadyStarted => "already_started",
            WorkerError::ShutdownTimeout { .. } => "shutdown_timeout",
        }
    }
}
