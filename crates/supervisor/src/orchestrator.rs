//! Service orchestrator.
//!
//! `ServiceOrchestrator` owns the registry of managed services:
//! 1. Spawns each service through a [`ProcessHandle`] (own process group).
//! 2. Polls its readiness check; a timeout degrades the service but never
//!    kills it.
//! 3. Starts sequences in order with a settle delay between entries.
//! 4. Reports a point-in-time status snapshot without waiting on any
//!    in-flight start.
//! 5. Shuts everything down in reverse start order, once, collecting
//!    per-service errors instead of stopping at the first.
//!
//! The registry lock is never held across an await on a process or a probe.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::probe::{cancelled, HealthProbe, ProbeOutcome, DEFAULT_ATTEMPT_TIMEOUT};
use crate::{ProcessHandle, ServiceSpec, SupervisorError, Termination};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pause between consecutive services of a sequence.
    pub settle_delay: Duration,
    /// How long a process group gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Cap for one readiness attempt.
    pub probe_attempt_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            grace_period: Duration::from_secs(5),
            probe_attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of one managed service.
///
/// `NotStarted → Starting → Healthy | DegradedButRunning → Stopping → Stopped`,
/// with `Starting → StartFailed` when the process never came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Healthy,
    /// Running, but the readiness check did not pass in time.
    DegradedButRunning,
    Stopping,
    Stopped,
    StartFailed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::DegradedButRunning => "degraded-but-running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::StartFailed => "start-failed",
        }
    }

    /// Whether a process is expected to exist in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Healthy | Self::DegradedButRunning)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub uptime: Option<Duration>,
    pub memory_bytes: Option<u64>,
    pub critical: bool,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct ServiceRecord {
    state: ServiceState,
    handle: Option<Arc<ProcessHandle>>,
    critical: bool,
    last_error: Option<String>,
}

impl ServiceRecord {
    fn new(critical: bool) -> Self {
        Self {
            state: ServiceState::NotStarted,
            handle: None,
            critical,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    /// Registered specs, in registration order.
    catalog: Vec<ServiceSpec>,
    records: HashMap<String, ServiceRecord>,
    /// Names of spawned services, oldest first.
    start_order: Vec<String>,
}

impl Registry {
    fn record_mut(&mut self, name: &str, critical: bool) -> &mut ServiceRecord {
        self.records
            .entry(name.to_owned())
            .or_insert_with(|| ServiceRecord::new(critical))
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of starting one entry of a sequence.
#[derive(Debug)]
pub struct StartOutcome {
    pub name: String,
    pub result: Result<ServiceState, SupervisorError>,
}

/// Result of [`ServiceOrchestrator::start_sequence`].
#[derive(Debug, Default)]
pub struct SequenceReport {
    pub outcomes: Vec<StartOutcome>,
    /// Entries never attempted because the sequence was aborted.
    pub skipped: Vec<String>,
    /// A critical service failed, or shutdown began mid-sequence.
    pub aborted: bool,
}

impl SequenceReport {
    /// Services that never came up.
    pub fn failed(&self) -> impl Iterator<Item = &StartOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Services running without having passed their readiness check.
    pub fn degraded(&self) -> impl Iterator<Item = &StartOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, Ok(ServiceState::DegradedButRunning)))
    }

    pub fn is_success(&self) -> bool {
        !self.aborted && self.failed().next().is_none()
    }

    /// One line per entry, keeping "failed to start" apart from
    /// "started but not yet healthy".
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.outcomes.len() + self.skipped.len());
        for outcome in &self.outcomes {
            lines.push(match &outcome.result {
                Ok(ServiceState::Healthy) => format!("✅ {}: healthy", outcome.name),
                Ok(ServiceState::DegradedButRunning) => {
                    format!("⚠️  {}: started but not yet healthy", outcome.name)
                }
                Ok(state) => format!("•  {}: {state}", outcome.name),
                Err(e) => format!("❌ {}: failed to start: {e}", outcome.name),
            });
        }
        for name in &self.skipped {
            lines.push(format!("⏭️  {name}: skipped"));
        }
        lines.join("\n")
    }
}

/// Result of [`ServiceOrchestrator::shutdown_all`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<(String, Termination)>,
    pub errors: Vec<(String, SupervisorError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A running service whose process was found gone by [`ServiceOrchestrator::reap_exited`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitedService {
    pub name: String,
    pub critical: bool,
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// ServiceOrchestrator
// ---------------------------------------------------------------------------

/// Shared, concurrency-safe supervisor of named services.
///
/// Wrap it in an `Arc` to start services from several tasks; status reads
/// only take the registry lock briefly.
pub struct ServiceOrchestrator {
    config: OrchestratorConfig,
    probe: HealthProbe,
    registry: RwLock<Registry>,
    shutdown_tx: watch::Sender<bool>,
    /// Serializes `shutdown_all` callers.
    shutdown_lock: Mutex<()>,
}

impl ServiceOrchestrator {
    /// # Errors
    /// [`SupervisorError::Http`] if the probe's HTTP client cannot be built.
    pub fn new(config: OrchestratorConfig) -> Result<Self, SupervisorError> {
        let probe = HealthProbe::new(config.probe_attempt_timeout)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            probe,
            registry: RwLock::new(Registry::default()),
            shutdown_tx,
            shutdown_lock: Mutex::new(()),
        })
    }

    /// Register `spec` so it can be started by name. Re-registering a name
    /// replaces its spec.
    pub fn with_service(mut self, spec: ServiceSpec) -> Self {
        let registry = self.registry.get_mut();
        registry.record_mut(&spec.name, spec.critical).critical = spec.critical;
        match registry.catalog.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec,
            None => registry.catalog.push(spec),
        }
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registered specs, in registration order.
    pub async fn catalog(&self) -> Vec<ServiceSpec> {
        self.registry.read().await.catalog.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start a registered service by name.
    ///
    /// # Errors
    /// [`SupervisorError::UnknownService`] if nothing is registered under `name`,
    /// otherwise as [`ServiceOrchestrator::start_service`].
    pub async fn start_named(&self, name: &str) -> Result<ServiceState, SupervisorError> {
        let spec = self
            .registry
            .read()
            .await
            .catalog
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownService(name.to_owned()))?;
        self.start_service(&spec).await
    }

    /// Spawn `spec` and wait for its readiness check.
    ///
    /// Returns [`ServiceState::Healthy`] or [`ServiceState::DegradedButRunning`];
    /// a readiness timeout is logged, not returned.
    ///
    /// # Errors
    /// - [`SupervisorError::ProcessSpawn`] if the executable cannot be launched.
    /// - [`SupervisorError::ExitedDuringStartup`] if the process died before
    ///   the readiness window closed.
    /// - [`SupervisorError::AlreadyRunning`] if the service has a live process.
    /// - [`SupervisorError::ShuttingDown`] if shutdown began before or during the start.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn start_service(&self, spec: &ServiceSpec) -> Result<ServiceState, SupervisorError> {
        let name = spec.name.as_str();

        {
            let mut registry = self.registry.write().await;
            if self.is_shutting_down() {
                return Err(SupervisorError::ShuttingDown);
            }
            if !registry.catalog.iter().any(|s| s.name == name) {
                registry.catalog.push(spec.clone());
            }
            let record = registry.record_mut(name, spec.critical);
            if record.state == ServiceState::Starting
                || record.handle.as_ref().is_some_and(|h| h.is_alive())
            {
                return Err(SupervisorError::AlreadyRunning(name.to_owned()));
            }
            record.state = ServiceState::Starting;
            record.handle = None;
            record.critical = spec.critical;
            record.last_error = None;
        }

        info!(command = %spec.command, "starting service");

        let handle = match ProcessHandle::start(name, &spec.command) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                error!("failed to start: {e}");
                self.set_state(name, ServiceState::StartFailed, Some(e.to_string())).await;
                return Err(e);
            }
        };

        // Shutdown raises its flag before taking the lock, so a process
        // registered here is always part of its snapshot.
        let registered = {
            let mut registry = self.registry.write().await;
            if self.is_shutting_down() {
                false
            } else {
                let record = registry.record_mut(name, spec.critical);
                record.handle = Some(Arc::clone(&handle));
                registry.start_order.retain(|n| n != name);
                registry.start_order.push(name.to_owned());
                true
            }
        };
        if !registered {
            warn!("shutdown began during spawn, stopping new process");
            let _ = handle.terminate(self.config.grace_period).await;
            self.set_state(name, ServiceState::Stopped, None).await;
            return Err(SupervisorError::ShuttingDown);
        }

        let mut state = ServiceState::Healthy;
        if let Some(check) = &spec.health {
            let mut cancel = self.shutdown_tx.subscribe();
            // A process that dies while being probed fails the start at once.
            let outcome = tokio::select! {
                outcome = self.probe.probe_cancellable(
                    &check.target,
                    check.timeout,
                    check.poll_interval,
                    &mut cancel,
                ) => Some(outcome),
                () = exited(&handle) => None,
            };
            match outcome {
                None => debug!("process exited before becoming ready"),
                Some(ProbeOutcome::Ready { attempts, elapsed }) => {
                    info!(attempts, ?elapsed, "service healthy");
                }
                Some(ProbeOutcome::TimedOut { attempts, elapsed }) => {
                    let timeout = SupervisorError::HealthCheckTimeout {
                        service: name.to_owned(),
                        waited: elapsed,
                        attempts,
                    };
                    warn!(target_url = %check.target, "{timeout}");
                    state = ServiceState::DegradedButRunning;
                    self.with_record(name, |r| r.last_error = Some(timeout.to_string())).await;
                }
                // The shutdown path owns the process from here on.
                Some(ProbeOutcome::Cancelled { .. }) => return Err(SupervisorError::ShuttingDown),
            }
        }

        if !handle.is_alive() {
            let status = handle
                .exit_status()
                .map_or_else(|| "exit status unknown".to_owned(), |s| s.to_string());
            let err = SupervisorError::ExitedDuringStartup {
                service: name.to_owned(),
                status,
            };
            error!("{err}");
            self.with_record(name, |r| {
                if r.state == ServiceState::Starting {
                    r.state = ServiceState::StartFailed;
                    r.last_error = Some(err.to_string());
                }
            })
            .await;
            return Err(err);
        }

        let mut applied = false;
        self.with_record(name, |r| {
            if r.state == ServiceState::Starting {
                r.state = state;
                applied = true;
            }
        })
        .await;
        if !applied {
            return Err(SupervisorError::ShuttingDown);
        }
        Ok(state)
    }

    /// Start `specs` one after another, pausing `settle_delay` between them.
    ///
    /// A failing entry is recorded and the sequence continues, unless the
    /// entry is critical. Shutdown interrupts the settle delay and skips the
    /// remaining entries.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn start_sequence(&self, specs: &[ServiceSpec]) -> SequenceReport {
        let mut report = SequenceReport::default();
        let mut cancel = self.shutdown_tx.subscribe();

        for (i, spec) in specs.iter().enumerate() {
            if self.is_shutting_down() {
                report.aborted = true;
                report.skipped.extend(specs[i..].iter().map(|s| s.name.clone()));
                break;
            }

            let result = self.start_service(spec).await;
            let critical_failure = spec.critical && result.is_err();
            report.outcomes.push(StartOutcome {
                name: spec.name.clone(),
                result,
            });

            if critical_failure {
                error!(service = %spec.name, "critical service failed to start, aborting sequence");
                report.aborted = true;
                report.skipped.extend(specs[i + 1..].iter().map(|s| s.name.clone()));
                break;
            }

            if i + 1 < specs.len() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.settle_delay) => {}
                    _ = cancelled(&mut cancel) => {}
                }
            }
        }

        report
    }

    /// Start every registered service in registration order.
    pub async fn start_all(&self) -> SequenceReport {
        let catalog = self.catalog().await;
        self.start_sequence(&catalog).await
    }

    /// Start `specs` concurrently; one slow readiness check does not delay
    /// the others. Outcomes keep the input order.
    pub async fn start_parallel(self: &Arc<Self>, specs: Vec<ServiceSpec>) -> SequenceReport {
        let mut tasks = JoinSet::new();
        for (i, spec) in specs.into_iter().enumerate() {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.start_service(&spec).await;
                (i, StartOutcome { name: spec.name, result })
            });
        }

        let mut collected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => collected.push(entry),
                Err(e) => error!("start task panicked: {e}"),
            }
        }
        collected.sort_by_key(|(i, _)| *i);

        SequenceReport {
            outcomes: collected.into_iter().map(|(_, o)| o).collect(),
            ..SequenceReport::default()
        }
    }

    /// Re-attach to a process started by an earlier invocation.
    ///
    /// A live process with a registered readiness check gets one attempt to
    /// tell `Healthy` from `DegradedButRunning`.
    pub async fn adopt(&self, name: &str, pid: u32, started_at: SystemTime) -> ServiceState {
        let handle = Arc::new(ProcessHandle::adopt(name, pid, started_at));
        let spec = self
            .registry
            .read()
            .await
            .catalog
            .iter()
            .find(|s| s.name == name)
            .cloned();

        let state = if !handle.is_alive() {
            ServiceState::Stopped
        } else {
            match spec.as_ref().and_then(|s| s.health.as_ref()) {
                Some(check) => {
                    let budget = self.probe.attempt_timeout();
                    let outcome = self.probe.probe(&check.target, budget, check.poll_interval).await;
                    if outcome.is_ready() {
                        ServiceState::Healthy
                    } else {
                        ServiceState::DegradedButRunning
                    }
                }
                None => ServiceState::Healthy,
            }
        };

        let mut registry = self.registry.write().await;
        let critical = spec.is_some_and(|s| s.critical);
        let record = registry.record_mut(name, critical);
        record.state = state;
        record.handle = Some(handle);
        registry.start_order.retain(|n| n != name);
        registry.start_order.push(name.to_owned());
        state
    }

    /// Snapshot of every known service. Never waits for a start in progress.
    pub async fn get_status(&self) -> BTreeMap<String, ServiceStatus> {
        let snapshot: Vec<_> = {
            let registry = self.registry.read().await;
            registry
                .records
                .iter()
                .map(|(name, r)| {
                    (name.clone(), r.state, r.handle.clone(), r.critical, r.last_error.clone())
                })
                .collect()
        };

        let mut out = BTreeMap::new();
        for (name, mut state, handle, critical, last_error) in snapshot {
            let mut status = ServiceStatus {
                state,
                pid: None,
                started_at: None,
                uptime: None,
                memory_bytes: None,
                critical,
                last_error,
            };
            if let Some(handle) = handle {
                status.pid = Some(handle.pid());
                if handle.is_alive() {
                    status.started_at = Some(handle.started_at());
                    status.uptime = Some(handle.uptime());
                    status.memory_bytes = handle.memory_usage().await;
                } else if state.is_running() {
                    state = ServiceState::Stopped;
                }
            }
            status.state = state;
            out.insert(name, status);
        }
        out
    }

    /// Mark running services whose process has exited as stopped.
    pub async fn reap_exited(&self) -> Vec<ExitedService> {
        let mut registry = self.registry.write().await;
        let mut exited = Vec::new();
        for (name, record) in registry.records.iter_mut() {
            if !record.state.is_running() {
                continue;
            }
            let Some(handle) = &record.handle else { continue };
            if handle.is_alive() {
                continue;
            }
            let exit_code = handle.exit_status().and_then(|s| s.code());
            warn!(service = %name, ?exit_code, critical = record.critical, "service exited");
            record.state = ServiceState::Stopped;
            record.last_error = Some(match exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "exited".to_owned(),
            });
            exited.push(ExitedService {
                name: name.clone(),
                critical: record.critical,
                exit_code,
            });
        }
        exited.sort_by(|a, b| a.name.cmp(&b.name));
        exited
    }

    /// Stop every spawned service in reverse start order.
    ///
    /// Runs at most once at a time; concurrent callers wait for the first.
    /// Every handle is processed even when some fail. A service that could
    /// not be stopped keeps its handle and stays `stopping`, so a later call
    /// retries it; everything else is left with nothing to stop. Once called,
    /// new starts are refused.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self, grace: Duration) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);
        let _guard = self.shutdown_lock.lock().await;

        let targets: Vec<(String, Arc<ProcessHandle>)> = {
            let mut registry = self.registry.write().await;
            let order = registry.start_order.clone();
            order
                .iter()
                .rev()
                .filter_map(|name| {
                    let record = registry.records.get_mut(name)?;
                    let handle = record.handle.clone()?;
                    record.state = ServiceState::Stopping;
                    Some((name.clone(), handle))
                })
                .collect()
        };

        if !targets.is_empty() {
            info!(count = targets.len(), "shutting down services");
        }

        let mut report = ShutdownReport::default();
        for (name, handle) in targets {
            match handle.terminate(grace).await {
                Ok(termination) => {
                    if termination == Termination::Killed {
                        warn!(service = %name, "forced kill after {grace:?}");
                    }
                    report.stopped.push((name, termination));
                }
                Err(e) => {
                    error!(service = %name, "shutdown failed: {e}");
                    report.errors.push((name, e));
                }
            }
        }

        let mut registry = self.registry.write().await;
        for (name, _) in &report.stopped {
            if let Some(record) = registry.records.get_mut(name) {
                record.state = ServiceState::Stopped;
                record.handle = None;
            }
        }
        for (name, e) in &report.errors {
            if let Some(record) = registry.records.get_mut(name) {
                record.last_error = Some(e.to_string());
            }
        }
        // Survivors stay in the shutdown order for the next call.
        let Registry { records, start_order, .. } = &mut *registry;
        start_order.retain(|name| records.get(name).is_some_and(|r| r.handle.is_some()));

        report
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn with_record(&self, name: &str, f: impl FnOnce(&mut ServiceRecord)) {
        if let Some(record) = self.registry.write().await.records.get_mut(name) {
            f(record);
        }
    }

    async fn set_state(&self, name: &str, state: ServiceState, last_error: Option<String>) {
        self.with_record(name, |r| {
            r.state = state;
            if last_error.is_some() {
                r.last_error = last_error;
            }
        })
        .await;
    }
}

/// Resolves once the process has exited. Never resolves if waiting fails.
async fn exited(handle: &ProcessHandle) {
    if let Err(e) = handle.wait().await {
        warn!(service = %handle.name(), "cannot wait for process: {e}");
        std::future::pending::<()>().await;
    }
}
