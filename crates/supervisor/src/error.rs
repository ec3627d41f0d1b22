//! Supervisor-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while starting, probing or stopping managed services.
#[derive(Debug, Error)]
pub enum SupervisorError {
    // ------ Lifecycle errors ------

    /// The executable could not be launched.
    #[error("service '{service}': failed to spawn '{program}': {source}")]
    ProcessSpawn {
        service: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The service did not pass its readiness check in time. Advisory only:
    /// the process keeps running.
    #[error("service '{service}' not ready after {waited:?} ({attempts} attempts)")]
    HealthCheckTimeout {
        service: String,
        waited: Duration,
        attempts: u32,
    },

    /// The process group survived SIGTERM, the grace period and SIGKILL.
    #[error("service '{service}' (pid {pid}) did not exit within {grace:?} after forced kill")]
    Shutdown {
        service: String,
        pid: u32,
        grace: Duration,
    },

    /// The OS refused to deliver a signal.
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The process spawned but was already gone once the readiness window closed.
    #[error("service '{service}' exited during startup ({status})")]
    ExitedDuringStartup { service: String, status: String },

    // ------ Lookup errors ------

    /// No service with this name is registered.
    #[error("unknown service: '{0}'")]
    UnknownService(String),

    /// The service already has a live process.
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    /// A start was requested after shutdown began.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
