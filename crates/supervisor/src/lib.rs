//! `supervisor` crate: start, health-check, monitor and tear down a set of
//! independently running child processes.
//!
//! Every child is spawned as the leader of its own process group and is
//! always terminated through that group, so whatever it spawned goes too.

pub mod error;
pub mod spec;
pub mod process;
pub mod probe;
pub mod orchestrator;

pub use error::SupervisorError;
pub use spec::{CommandSpec, HealthCheck, ProbeTarget, ServiceSpec};
pub use process::{ProcessHandle, Termination};
pub use probe::{HealthProbe, ProbeOutcome, DEFAULT_ATTEMPT_TIMEOUT};
pub use orchestrator::{
    ExitedService, OrchestratorConfig, SequenceReport, ServiceOrchestrator, ServiceState,
    ServiceStatus, ShutdownReport, StartOutcome,
};
