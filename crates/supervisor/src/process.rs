//! `ProcessHandle`: one externally spawned process and its process group.
//!
//! On Unix the child is placed in a new process group whose ID equals its
//! PID. Termination always signals the group, never the bare PID, so
//! grandchildren (npm → node, python → workers) are reached as well.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{CommandSpec, SupervisorError};

/// How long to wait for the group to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Liveness polling cadence for adopted processes (no child handle to wait on).
const ADOPTED_POLL: Duration = Duration::from_millis(100);

/// How a [`ProcessHandle::terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to do: the process had already exited or was terminated before.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Handle to one spawned (or adopted) process group.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    /// `None` for adopted processes that this process did not spawn.
    child: Option<Mutex<Child>>,
    exit_status: StdMutex<Option<ExitStatus>>,
    exited: AtomicBool,
    terminated: AtomicBool,
    started_at: SystemTime,
}

impl ProcessHandle {
    /// Spawn `spec` detached into its own process group.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`SupervisorError::ProcessSpawn`] if the executable cannot be launched.
    pub fn start(name: &str, spec: &CommandSpec) -> Result<Self, SupervisorError> {
        let spawn_error = |source: std::io::Error| SupervisorError::ProcessSpawn {
            service: name.to_owned(),
            program: spec.program.clone(),
            source,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP

        let child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before its pid could be read",
            ))
        })?;

        info!(service = name, pid, command = %spec, "process spawned");

        Ok(Self {
            name: name.to_owned(),
            pid,
            child: Some(Mutex::new(child)),
            exit_status: StdMutex::new(None),
            exited: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            started_at: SystemTime::now(),
        })
    }

    /// Re-attach to a process group started by an earlier invocation.
    /// Exit statuses of adopted processes are never available.
    pub fn adopt(name: &str, pid: u32, started_at: SystemTime) -> Self {
        Self {
            name: name.to_owned(),
            pid,
            child: None,
            exit_status: StdMutex::new(None),
            exited: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            started_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status.lock().ok().and_then(|s| *s)
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }

        let alive = match &self.child {
            Some(child) => match child.try_lock() {
                Ok(mut child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        self.record_exit(Some(status));
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        warn!(service = %self.name, pid = self.pid, "try_wait failed: {e}");
                        true
                    }
                },
                // Someone is waiting on the child; they record the exit.
                Err(_) => true,
            },
            None => group_alive(self.pid),
        };

        if !alive && self.child.is_none() {
            self.record_exit(None);
        }
        alive
    }

    /// Wait for the process to exit.
    ///
    /// Cancel safe: dropping the future (e.g. from `tokio::select!` or
    /// `tokio::time::timeout`) leaves the handle usable.
    pub async fn wait(&self) -> Result<Option<ExitStatus>, SupervisorError> {
        if self.exited.load(Ordering::Acquire) {
            return Ok(self.exit_status());
        }

        match &self.child {
            Some(child) => {
                let mut child = child.lock().await;
                if self.exited.load(Ordering::Acquire) {
                    return Ok(self.exit_status());
                }
                let status = child.wait().await?;
                self.record_exit(Some(status));
                Ok(Some(status))
            }
            None => {
                while self.is_alive() {
                    tokio::time::sleep(ADOPTED_POLL).await;
                }
                Ok(None)
            }
        }
    }

    /// Wait at most `limit`; returns whether the process exited.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<bool, SupervisorError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// SIGTERM the group, wait up to `grace`, then SIGKILL the group.
    ///
    /// Idempotent: once a call has completed, later calls return
    /// [`Termination::AlreadyExited`] without sending anything.
    ///
    /// # Errors
    /// - [`SupervisorError::Shutdown`] if the group survives SIGKILL.
    /// - [`SupervisorError::Signal`] if the OS rejects a signal.
    #[instrument(skip(self), fields(service = %self.name, pid = self.pid))]
    pub async fn terminate(&self, grace: Duration) -> Result<Termination, SupervisorError> {
        if self.terminated.load(Ordering::Acquire) {
            return Ok(Termination::AlreadyExited);
        }

        if !self.is_alive() {
            // The leader is gone; sweep anything it left behind in the group.
            self.sweep_group();
            self.terminated.store(true, Ordering::Release);
            return Ok(Termination::AlreadyExited);
        }

        debug!("sending SIGTERM to process group");
        if !self.signal(GroupSignal::Terminate)? {
            self.terminated.store(true, Ordering::Release);
            return Ok(Termination::AlreadyExited);
        }

        if self.wait_timeout(grace).await? {
            self.sweep_group();
            self.terminated.store(true, Ordering::Release);
            info!("process stopped");
            return Ok(Termination::Graceful);
        }

        warn!("still alive after {grace:?}, killing process group");
        self.signal(GroupSignal::Kill)?;

        if self.wait_timeout(KILL_WAIT).await? {
            self.terminated.store(true, Ordering::Release);
            info!("process killed");
            return Ok(Termination::Killed);
        }

        Err(SupervisorError::Shutdown {
            service: self.name.clone(),
            pid: self.pid,
            grace,
        })
    }

    /// Resident memory of the group leader in bytes, when the platform
    /// exposes it.
    pub async fn memory_usage(&self) -> Option<u64> {
        if !self.is_alive() {
            return None;
        }
        resident_set_bytes(self.pid).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn record_exit(&self, status: Option<ExitStatus>) {
        if let Ok(mut slot) = self.exit_status.lock() {
            if slot.is_none() {
                *slot = status;
            }
        }
        self.exited.store(true, Ordering::Release);
    }

    /// Returns `false` when there was nothing left to signal.
    #[cfg(unix)]
    fn signal(&self, signal: GroupSignal) -> Result<bool, SupervisorError> {
        let signo = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        signal_group(self.pid, signo)
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: GroupSignal) -> Result<bool, SupervisorError> {
        let Some(child) = &self.child else {
            return Err(SupervisorError::Signal {
                pgid: self.pid,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "adopted processes cannot be signalled on this platform",
                ),
            });
        };
        match child.try_lock() {
            Ok(mut child) => child.start_kill().map(|_| true).map_err(|source| {
                SupervisorError::Signal { pgid: self.pid, source }
            }),
            Err(_) => Ok(true),
        }
    }

    fn sweep_group(&self) {
        #[cfg(unix)]
        if group_alive(self.pid) {
            if let Err(e) = signal_group(self.pid, libc::SIGKILL) {
                warn!(service = %self.name, "failed to sweep process group: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OS helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn signal_group(pgid: u32, signo: libc::c_int) -> Result<bool, SupervisorError> {
    // Group 0 is our own and -1 addresses every process.
    let pgid_t = match libc::pid_t::try_from(pgid) {
        Ok(pgid_t) if pgid_t > 1 => pgid_t,
        _ => return Ok(false),
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid_t, signo) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(SupervisorError::Signal { pgid, source: err })
    }
}

/// Whether any member of the process group is still around.
#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    let pgid_t = match libc::pid_t::try_from(pgid) {
        Ok(pgid_t) if pgid_t > 1 => pgid_t,
        _ => return false,
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(-pgid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
async fn resident_set_bytes(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
async fn resident_set_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Extract `VmRSS` (reported in kB) from a `/proc/<pid>/status` dump.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
