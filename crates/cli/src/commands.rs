//! Sub-command implementations.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use supervisor::{
    ProcessHandle, SequenceReport, ServiceOrchestrator, ServiceSpec, ServiceState, Termination,
};
use tracing::{info, warn};

use crate::config::SuiteConfig;
use crate::state::SuiteState;

/// How often the foreground loop checks for exited services.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

fn orchestrator(config: &SuiteConfig) -> Result<ServiceOrchestrator> {
    let orch = ServiceOrchestrator::new(config.orchestrator_config())
        .context("cannot build service orchestrator")?;
    Ok(config
        .catalog()
        .into_iter()
        .fold(orch, ServiceOrchestrator::with_service))
}

// ---------------------------------------------------------------------------
// start / up
// ---------------------------------------------------------------------------

/// `start <service>`: run one service in the foreground.
pub async fn start(config: &SuiteConfig, name: &str) -> Result<ExitCode> {
    let spec = config
        .catalog()
        .into_iter()
        .find(|s| s.name == name)
        .with_context(|| format!("unknown service '{name}' (expected backend, webui or ui)"))?;
    run_foreground(config, vec![spec], None).await
}

/// `up`: run the whole suite in the foreground, optionally opening the web
/// UI in a browser once it is healthy.
pub async fn up(config: &SuiteConfig, open_browser: bool) -> Result<ExitCode> {
    let browse = open_browser.then(|| ("webui".to_owned(), config.webui_url()));
    run_foreground(config, config.catalog(), browse).await
}

enum StopReason {
    Signal,
    StartAborted,
    CriticalExit(String),
    NothingRunning,
}

/// `browse` names a service and the URL to open once it is healthy.
async fn run_foreground(
    config: &SuiteConfig,
    specs: Vec<ServiceSpec>,
    browse: Option<(String, String)>,
) -> Result<ExitCode> {
    let state_path = config.state_path();
    refuse_if_running(&state_path, &specs)?;
    check_prerequisites(&specs)?;

    let orch = Arc::new(orchestrator(config)?);
    let owned: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

    println!("🚀 Starting {}", owned.join(", "));
    let mut sequence = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.start_sequence(&specs).await })
    };
    let mut sequence_done = false;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut reap = tokio::time::interval(REAP_INTERVAL);

    let reason = loop {
        tokio::select! {
            joined = &mut sequence, if !sequence_done => {
                sequence_done = true;
                let report = match joined {
                    Ok(report) => report,
                    Err(e) => {
                        eprintln!("❌ Start sequence failed: {e}");
                        break StopReason::StartAborted;
                    }
                };
                println!("{}", report.summary());
                if let Some((service, url)) = &browse {
                    if is_healthy(&report, service) {
                        open_browser(url);
                    }
                }
                persist(&orch, &state_path, &owned).await;
                if report.aborted {
                    break StopReason::StartAborted;
                }
                if !any_running(&orch).await {
                    break StopReason::NothingRunning;
                }
                println!("Press Ctrl+C to stop all services");
            }
            _ = &mut shutdown => break StopReason::Signal,
            _ = reap.tick() => {
                let exited = orch.reap_exited().await;
                if exited.is_empty() {
                    continue;
                }
                for service in &exited {
                    match service.exit_code {
                        Some(code) => eprintln!("❌ {} stopped unexpectedly (exit code {code})", service.name),
                        None => eprintln!("❌ {} stopped unexpectedly", service.name),
                    }
                }
                persist(&orch, &state_path, &owned).await;
                if let Some(critical) = exited.iter().find(|s| s.critical) {
                    break StopReason::CriticalExit(critical.name.clone());
                }
                if sequence_done && !any_running(&orch).await {
                    break StopReason::NothingRunning;
                }
            }
        }
    };

    match &reason {
        StopReason::Signal => println!("\n🛑 Received interrupt signal"),
        StopReason::StartAborted => eprintln!("❌ A critical service failed to start"),
        StopReason::CriticalExit(name) => eprintln!("❌ Critical service '{name}' exited"),
        StopReason::NothingRunning => println!("No services left running"),
    }

    println!("🛑 Shutting down services...");
    let report = orch.shutdown_all(config.grace_period()).await;
    if !sequence_done {
        // Shutdown cancels any in-flight readiness wait, so this returns promptly.
        if let Ok(partial) = sequence.await {
            info!(aborted = partial.aborted, "start sequence interrupted");
        }
    }
    print_shutdown(&report.stopped, &report.errors);
    persist(&orch, &state_path, &owned).await;

    let clean = report.is_clean() && matches!(reason, StopReason::Signal);
    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Another invocation already runs one of `specs`.
fn refuse_if_running(state_path: &Path, specs: &[ServiceSpec]) -> Result<()> {
    let state = SuiteState::load(state_path)?;
    for spec in specs {
        if let Some(recorded) = state.services.get(&spec.name) {
            let handle = ProcessHandle::adopt(&spec.name, recorded.pid, recorded.started_at_system());
            if handle.is_alive() {
                bail!(
                    "service '{}' is already running (pid {}); run `workflow-suite stop` first",
                    spec.name,
                    recorded.pid
                );
            }
        }
    }
    Ok(())
}

/// A service whose program or working directory is missing.
#[derive(Debug)]
struct MissingPrerequisite {
    service: String,
    critical: bool,
    problem: String,
}

fn missing_prerequisites(specs: &[ServiceSpec]) -> Vec<MissingPrerequisite> {
    let search_path = std::env::var_os("PATH");
    let mut missing = Vec::new();
    for spec in specs {
        let cwd = spec.command.working_dir.as_deref();
        let mut problem = None;
        if let Some(dir) = cwd.filter(|dir| !dir.is_dir()) {
            problem = Some(format!("working directory {} does not exist", dir.display()));
        } else if find_program(&spec.command.program, cwd, search_path.as_deref()).is_none() {
            problem = Some(format!("'{}' not found", spec.command.program));
        }
        if let Some(problem) = problem {
            missing.push(MissingPrerequisite {
                service: spec.name.clone(),
                critical: spec.critical,
                problem,
            });
        }
    }
    missing
}

/// Report missing programs before anything is spawned. Only a critical
/// service with a missing prerequisite stops the launch.
fn check_prerequisites(specs: &[ServiceSpec]) -> Result<()> {
    println!("🔍 Checking prerequisites...");
    let missing = missing_prerequisites(specs);
    for m in &missing {
        eprintln!("❌ {}: {}", m.service, m.problem);
    }
    if let Some(m) = missing.iter().find(|m| m.critical) {
        bail!("critical service '{}' cannot start: {}", m.service, m.problem);
    }
    Ok(())
}

/// Resolve `program` the way spawning would: paths are taken as given
/// (relative to `cwd`), bare names are looked up in `search_path`.
fn find_program(program: &str, cwd: Option<&Path>, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        let resolved = match cwd {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        };
        return is_executable(&resolved).then_some(resolved);
    }
    std::env::split_paths(search_path?)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

fn is_healthy(report: &SequenceReport, service: &str) -> bool {
    report
        .outcomes
        .iter()
        .any(|o| o.name == service && matches!(o.result, Ok(ServiceState::Healthy)))
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let mut cmd = tokio::process::Command::new("open");
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    };
    #[cfg(not(any(target_os = "macos", windows)))]
    let mut cmd = tokio::process::Command::new("xdg-open");

    let spawned = cmd
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(_) => println!("🌐 Opened {url} in browser"),
        Err(e) => eprintln!("⚠️  Could not open browser: {e}"),
    }
}

async fn any_running(orch: &ServiceOrchestrator) -> bool {
    orch.get_status()
        .await
        .values()
        .any(|s| s.state.is_running() || s.state == ServiceState::Starting)
}

/// Rewrite the entries this invocation owns, keeping everyone else's.
async fn persist(orch: &ServiceOrchestrator, path: &Path, owned: &[String]) {
    let result = async {
        let mut state = SuiteState::load(path)?;
        state.services.retain(|name, _| !owned.contains(name));
        for (name, status) in orch.get_status().await {
            if let (true, Some(pid), Some(started_at)) =
                (owned.contains(&name), status.pid, status.started_at)
            {
                state.insert(&name, pid, started_at);
            }
        }
        state.save(path)
    }
    .await;

    if let Err(e) = result {
        warn!("cannot update state file: {e:#}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_shutdown(stopped: &[(String, Termination)], errors: &[(String, supervisor::SupervisorError)]) {
    for (name, termination) in stopped {
        match termination {
            Termination::Graceful => println!("✅ Stopped {name}"),
            Termination::Killed => println!("🔪 Force killed {name}"),
            Termination::AlreadyExited => println!("•  {name} had already exited"),
        }
    }
    for (name, e) in errors {
        eprintln!("⚠️  Error stopping {name}: {e}");
    }
}

// ---------------------------------------------------------------------------
// status / stop
// ---------------------------------------------------------------------------

/// Adopt everything the state file lists.
async fn adopt_recorded(config: &SuiteConfig) -> Result<Option<ServiceOrchestrator>> {
    let state = SuiteState::load(&config.state_path())?;
    if state.services.is_empty() {
        return Ok(None);
    }
    let orch = orchestrator(config)?;
    for (name, recorded) in &state.services {
        orch.adopt(name, recorded.pid, recorded.started_at_system()).await;
    }
    Ok(Some(orch))
}

/// `status`: print a snapshot of the services recorded in the state file.
pub async fn status(config: &SuiteConfig) -> Result<ExitCode> {
    let Some(orch) = adopt_recorded(config).await? else {
        println!("No services running");
        return Ok(ExitCode::SUCCESS);
    };

    println!("{:<10} {:<22} {:>8} {:>12} {:>10}", "SERVICE", "STATE", "PID", "UPTIME", "MEMORY");
    for (name, status) in orch.get_status().await {
        println!(
            "{:<10} {:<22} {:>8} {:>12} {:>10}",
            name,
            status.state.to_string(),
            status.pid.map_or_else(|| "-".to_owned(), |p| p.to_string()),
            status.uptime.map_or_else(|| "-".to_owned(), format_uptime),
            status.memory_bytes.map_or_else(|| "-".to_owned(), format_memory),
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// `stop`: terminate every service recorded in the state file.
pub async fn stop(config: &SuiteConfig) -> Result<ExitCode> {
    let Some(orch) = adopt_recorded(config).await? else {
        println!("No services running");
        return Ok(ExitCode::SUCCESS);
    };

    println!("🛑 Shutting down services...");
    let report = orch.shutdown_all(config.grace_period()).await;
    print_shutdown(&report.stopped, &report.errors);
    if report.is_clean() {
        SuiteState::remove(&config.state_path())?;
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

fn format_memory(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// `validate <path>`: check a workflow JSON file and print its step order.
/// Returns whether the workflow is valid.
pub fn validate(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;

    match serde_json::from_str::<workflow::Workflow>(&content) {
        Ok(wf) => {
            let order: Vec<&str> = wf.get_steps_by_order().iter().map(|s| s.name.as_str()).collect();
            println!("✅ Workflow '{}' is valid. Execution order: {order:?}", wf.name);
            Ok(true)
        }
        Err(e) => {
            eprintln!("❌ Validation failed: {e}");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_human_readable() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn memory_is_shown_in_mebibytes() {
        assert_eq!(format_memory(3 * 1024 * 1024 / 2), "1.5 MiB");
    }

    #[test]
    fn validate_accepts_good_and_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(
            &good,
            r#"{
                "name": "Login",
                "steps": [
                    {"id": "b", "name": "Wait", "step_type": "delay", "order": 2,
                     "config": {"duration_seconds": 1}},
                    {"id": "a", "name": "Open", "step_type": "browser_action", "order": 1,
                     "config": {"action": "navigate", "target": "https://example.com"}}
                ]
            }"#,
        )
        .unwrap();
        assert!(validate(&good).unwrap());

        let bad = dir.path().join("bad.json");
        std::fs::write(
            &bad,
            r#"{"name": "Broken", "steps": [
                {"id": "a", "name": "Wait", "step_type": "delay", "order": 1, "config": {}}
            ]}"#,
        )
        .unwrap();
        assert!(!validate(&bad).unwrap());

        assert!(validate(&dir.path().join("missing.json")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn programs_are_found_only_when_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("launch");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("notes");
        std::fs::write(&plain, "").unwrap();

        let search = std::env::join_paths(["/no/such/dir", dir.path().to_str().unwrap()]).unwrap();
        assert_eq!(find_program("launch", None, Some(search.as_os_str())), Some(script.clone()));
        assert_eq!(find_program("notes", None, Some(search.as_os_str())), None);
        assert_eq!(find_program("launch", None, None), None);

        // Paths skip the search and are taken relative to the working directory.
        assert_eq!(find_program("./launch", Some(dir.path()), None), Some(dir.path().join("./launch")));
        assert_eq!(find_program(script.to_str().unwrap(), None, None), Some(script));
    }

    #[test]
    fn missing_programs_and_directories_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let specs = [
            ServiceSpec::new("backend", supervisor::CommandSpec::new("sh").current_dir(dir.path())),
            ServiceSpec::new("ui", supervisor::CommandSpec::new("no-such-tool-7f3a")),
            ServiceSpec::new(
                "webui",
                supervisor::CommandSpec::new("sh").current_dir(dir.path().join("absent")),
            )
            .critical(true),
        ];

        let missing = missing_prerequisites(&specs);

        let names: Vec<_> = missing.iter().map(|m| m.service.as_str()).collect();
        assert_eq!(names, ["ui", "webui"]);
        assert!(missing[0].problem.contains("'no-such-tool-7f3a' not found"));
        assert!(missing[1].problem.contains("does not exist"));
        assert!(missing[1].critical);

        let err = check_prerequisites(&specs).unwrap_err();
        assert!(err.to_string().contains("critical service 'webui'"));
        assert!(check_prerequisites(&specs[..2]).is_ok());
    }

    #[test]
    fn browser_opens_only_for_a_healthy_service() {
        let report = SequenceReport {
            outcomes: vec![
                supervisor::StartOutcome { name: "backend".into(), result: Ok(ServiceState::Healthy) },
                supervisor::StartOutcome {
                    name: "webui".into(),
                    result: Ok(ServiceState::DegradedButRunning),
                },
            ],
            ..SequenceReport::default()
        };
        assert!(is_healthy(&report, "backend"));
        assert!(!is_healthy(&report, "webui"));
        assert!(!is_healthy(&report, "ui"));
    }

    #[test]
    fn dead_recorded_pid_does_not_block_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = SuiteState::default();
        // Far above any pid_max.
        state.insert("backend", 999_999_999, std::time::SystemTime::now());
        state.save(&path).unwrap();

        let spec = ServiceSpec::new("backend", supervisor::CommandSpec::new("true"));
        refuse_if_running(&path, &[spec]).unwrap();
    }
}
