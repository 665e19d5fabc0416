use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{LaunchError, LauncherError, Result};
use crate::store::InstalledVersion;
use crate::version::SemanticVersion;

pub const LOCK_FILE_NAME: &str = "firmata.pid";
pub const OUTPUT_LOG_NAME: &str = "launcher-output.log";
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Launching,
    Running,
    Stopping,
    LockedByOther,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Launching => "launching",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::LockedByOther => "locked by another process",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInstance {
    pub version: SemanticVersion,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "port")]
pub enum LockSource {
    PidFile,
    Port(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockingProcess {
    pub pid: u32,
    pub source: LockSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    AlreadyStopped,
    /// The process was already gone when the stop began.
    Exited,
    Graceful,
    Forced,
    /// Another caller's stop was in flight; this one waited for it.
    Coalesced,
}

/// Command template for the runtime. `{artifact}` and `{version_dir}` in the
/// arguments are substituted at launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            program: runtime.program.clone(),
            args: runtime.args.clone(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn resolved_args(&self, artifact: &Path, version_dir: &Path) -> Vec<String> {
        let artifact = artifact.to_string_lossy();
        let version_dir = version_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{artifact}", &artifact)
                    .replace("{version_dir}", &version_dir)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub lock_path: PathBuf,
    pub port: Option<u16>,
    pub grace_period: Duration,
    pub settle: Duration,
    pub poll_interval: Duration,
    /// Text the runtime's command line must contain (the artifact name) for a
    /// pid from the lock file to count as a running runtime.
    pub runtime_marker: Option<String>,
}

impl SupervisorSettings {
    pub fn from_config(runtime: &RuntimeConfig, install_root: &Path, artifact_name: &str) -> Self {
        Self {
            lock_path: install_root.join(LOCK_FILE_NAME),
            port: runtime.port(),
            grace_period: runtime.grace_period(),
            settle: runtime.settle(),
            poll_interval: Duration::from_millis(100),
            runtime_marker: Some(artifact_name.to_string()),
        }
    }
}

#[derive(Debug)]
struct SupervisorShared {
    state: SupervisorState,
    instance: Option<RunningInstance>,
    child: Option<Child>,
    locking: Option<LockingProcess>,
}

/// Owns the single runtime child process. Clones share the same state, so the
/// control loop and the interrupt path observe one lifecycle.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    settings: Arc<SupervisorSettings>,
    shared: Arc<(Mutex<SupervisorShared>, Condvar)>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            shared: Arc::new((
                Mutex::new(SupervisorShared {
                    state: SupervisorState::Stopped,
                    instance: None,
                    child: None,
                    locking: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn lock_shared(&self) -> MutexGuard<'_, SupervisorShared> {
        self.shared.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SupervisorState {
        self.lock_shared().state
    }

    pub fn instance(&self) -> Option<RunningInstance> {
        self.lock_shared().instance.clone()
    }

    pub fn locking_process(&self) -> Option<LockingProcess> {
        self.lock_shared().locking.clone()
    }

    /// True while a child started by this supervisor is alive or being handled.
    pub fn owns_runtime(&self) -> bool {
        matches!(
            self.lock_shared().state,
            SupervisorState::Launching | SupervisorState::Running | SupervisorState::Stopping
        )
    }

    pub fn launch(
        &self,
        installed: &InstalledVersion,
        artifact: &Path,
        spec: &LaunchSpec,
    ) -> Result<RunningInstance> {
        {
            let mut shared = self.lock_shared();
            match shared.state {
                SupervisorState::Stopped => shared.state = SupervisorState::Launching,
                SupervisorState::LockedByOther => {
                    let pid = shared.locking.as_ref().map(|l| l.pid).unwrap_or(0);
                    return Err(LaunchError::LockedByOther { pid }.into());
                }
                other => return Err(LaunchError::InvalidState(other).into()),
            }
        }
        info!(version = %installed.version, "launching runtime");

        let result = self.spawn_checked(installed, artifact, spec);

        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = match result {
            Ok((child, instance)) => {
                shared.child = Some(child);
                shared.instance = Some(instance.clone());
                shared.state = SupervisorState::Running;
                info!(version = %instance.version, pid = instance.pid, "runtime running");
                Ok(instance)
            }
            Err(Spawned::Locked(locking)) => {
                warn!(pid = locking.pid, source = ?locking.source, "runtime is locked by another process");
                let pid = locking.pid;
                shared.locking = Some(locking);
                shared.state = SupervisorState::LockedByOther;
                Err(LaunchError::LockedByOther { pid }.into())
            }
            Err(Spawned::Failed(err)) => {
                warn!(error = %err, "launch failed");
                shared.state = SupervisorState::Stopped;
                Err(err)
            }
        };
        condvar.notify_all();
        outcome
    }

    fn spawn_checked(
        &self,
        installed: &InstalledVersion,
        artifact: &Path,
        spec: &LaunchSpec,
    ) -> std::result::Result<(Child, RunningInstance), Spawned> {
        if let Some(locking) = self.detect_locking_process() {
            return Err(Spawned::Locked(locking));
        }
        if !artifact.is_file() {
            return Err(LauncherError::from(LaunchError::ExecutableMissing(artifact.to_path_buf())).into());
        }
        let program = resolve_program(&spec.program)
            .ok_or_else(|| LauncherError::from(LaunchError::PrerequisiteMissing(spec.program.clone())))?;

        let log_path = installed.path.join(OUTPUT_LOG_NAME);
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;
        let mut child = Command::new(&program)
            .args(spec.resolved_args(artifact, &installed.path))
            .current_dir(&installed.path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| {
                LauncherError::from(LaunchError::Spawn {
                    program: program.display().to_string(),
                    source,
                })
            })?;
        let pid = child.id();
        debug!(pid, program = %program.display(), "child spawned");

        let deadline = Instant::now() + self.settings.settle;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(LauncherError::from(LaunchError::ExitedEarly(format!(
                    "{status}; see {}",
                    log_path.display()
                )))
                .into());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.settings.poll_interval.min(self.settings.settle));
        }

        if let Err(err) = write_pid_file(&self.settings.lock_path, pid) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }
        Ok((
            child,
            RunningInstance {
                version: installed.version.clone(),
                pid,
                started_at: Utc::now(),
            },
        ))
    }

    /// Stops the tracked child, or the locking process when that is what the
    /// supervisor is holding. Ends in Stopped unless forced termination fails.
    pub fn stop(&self) -> Result<StopOutcome> {
        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if shared.state == SupervisorState::Launching {
            let limit = self.settings.settle + self.settings.grace_period;
            let (guard, _) = condvar
                .wait_timeout_while(shared, limit, |s| s.state == SupervisorState::Launching)
                .unwrap_or_else(PoisonError::into_inner);
            shared = guard;
            if shared.state == SupervisorState::Launching {
                return Err(LauncherError::NotYetRunning);
            }
        }

        let state = shared.state;
        match state {
            SupervisorState::Stopped => Ok(StopOutcome::AlreadyStopped),
            SupervisorState::Launching => Err(LauncherError::NotYetRunning),
            SupervisorState::Stopping => {
                debug!("stop already in flight, waiting");
                let _guard = condvar
                    .wait_while(shared, |s| s.state == SupervisorState::Stopping)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(StopOutcome::Coalesced)
            }
            SupervisorState::Running => {
                let Some(mut child) = shared.child.take() else {
                    shared.state = SupervisorState::Stopped;
                    shared.instance = None;
                    condvar.notify_all();
                    return Ok(StopOutcome::AlreadyStopped);
                };
                shared.state = SupervisorState::Stopping;
                drop(shared);

                let result = terminate_child(&mut child, &self.settings);

                let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
                match &result {
                    Ok(outcome) => {
                        if let Some(instance) = shared.instance.take() {
                            info!(version = %instance.version, pid = instance.pid, outcome = ?outcome, "runtime stopped");
                        }
                        shared.state = SupervisorState::Stopped;
                        remove_pid_file(&self.settings.lock_path);
                    }
                    Err(err) => {
                        warn!(error = %err, "runtime could not be terminated");
                        shared.child = Some(child);
                        shared.state = SupervisorState::Running;
                    }
                }
                condvar.notify_all();
                result
            }
            SupervisorState::LockedByOther => {
                let Some(locking) = shared.locking.clone() else {
                    shared.state = SupervisorState::Stopped;
                    condvar.notify_all();
                    return Ok(StopOutcome::AlreadyStopped);
                };
                shared.state = SupervisorState::Stopping;
                drop(shared);

                let result = terminate_pid(locking.pid, &self.settings);

                let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
                if result.is_ok() {
                    shared.locking = None;
                    shared.state = SupervisorState::Stopped;
                    if locking.source == LockSource::PidFile {
                        remove_pid_file(&self.settings.lock_path);
                    }
                } else {
                    shared.state = SupervisorState::LockedByOther;
                }
                condvar.notify_all();
                result
            }
        }
    }

    /// Notices a child that exited on its own and releases it.
    pub fn poll_exit(&self) -> Option<(RunningInstance, String)> {
        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.state != SupervisorState::Running {
            return None;
        }
        let status = match shared.child.as_mut()?.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "failed to poll runtime process");
                return None;
            }
        };
        shared.child = None;
        shared.state = SupervisorState::Stopped;
        let instance = shared.instance.take()?;
        remove_pid_file(&self.settings.lock_path);
        condvar.notify_all();
        info!(version = %instance.version, pid = instance.pid, status = %status, "runtime exited");
        Some((instance, status.to_string()))
    }

    /// Looks at OS-level state only: a live runtime pid in the lock file that is
    /// not our own child, then a listener on the configured port. A pid that now
    /// belongs to an unrelated process makes the lock file stale.
    pub fn detect_locking_process(&self) -> Option<LockingProcess> {
        let own = self.lock_shared().instance.as_ref().map(|i| i.pid);
        let lock_path = &self.settings.lock_path;
        if let Some(pid) = read_pid_file(lock_path) {
            if Some(pid) != own {
                if pid != std::process::id() && process_is_alive(pid) {
                    if self.is_runtime(pid) {
                        return Some(LockingProcess {
                            pid,
                            source: LockSource::PidFile,
                        });
                    }
                    info!(pid, "pid file names a process that is not the runtime");
                }
                debug!(pid, path = %lock_path.display(), "removing stale pid file");
                remove_pid_file(lock_path);
            }
        }
        if own.is_some() {
            return None;
        }
        let port = self.settings.port?;
        if !port_in_use(port) {
            return None;
        }
        match port_owner(port) {
            Some(pid) if pid != std::process::id() => Some(LockingProcess {
                pid,
                source: LockSource::Port(port),
            }),
            _ => {
                warn!(port, "port is in use but its owner could not be identified");
                None
            }
        }
    }

    fn is_runtime(&self, pid: u32) -> bool {
        let Some(marker) = self.settings.runtime_marker.as_deref() else {
            return true;
        };
        match process_command_line(pid) {
            Some(cmdline) => cmdline.contains(marker),
            None => {
                debug!(pid, "command line unavailable, assuming runtime");
                true
            }
        }
    }

    pub fn kill_locking_process(&self) -> Result<Option<(LockingProcess, StopOutcome)>> {
        let Some(locking) = self.detect_locking_process() else {
            let (lock, condvar) = &*self.shared;
            let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.state == SupervisorState::LockedByOther {
                shared.state = SupervisorState::Stopped;
                shared.locking = None;
                condvar.notify_all();
            }
            return Ok(None);
        };
        info!(pid = locking.pid, source = ?locking.source, "terminating locking process");
        let outcome = terminate_pid(locking.pid, &self.settings)?;
        if locking.source == LockSource::PidFile {
            remove_pid_file(&self.settings.lock_path);
        }
        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.state == SupervisorState::LockedByOther {
            shared.state = SupervisorState::Stopped;
            shared.locking = None;
        }
        condvar.notify_all();
        Ok(Some((locking, outcome)))
    }
}

enum Spawned {
    Locked(LockingProcess),
    Failed(LauncherError),
}

impl From<LauncherError> for Spawned {
    fn from(err: LauncherError) -> Self {
        Spawned::Failed(err)
    }
}

impl From<io::Error> for Spawned {
    fn from(err: io::Error) -> Self {
        Spawned::Failed(LauncherError::Io(err))
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    which::which(program).ok()
}

fn terminate_child(child: &mut Child, settings: &SupervisorSettings) -> Result<StopOutcome> {
    if child.try_wait()?.is_some() {
        return Ok(StopOutcome::Exited);
    }
    let pid = child.id();
    if request_termination(pid) {
        let deadline = Instant::now() + settings.grace_period;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(StopOutcome::Graceful);
            }
            thread::sleep(settings.poll_interval);
        }
        warn!(pid, "grace period elapsed, forcing termination");
    }
    child
        .kill()
        .map_err(|err| LauncherError::ForcedTerminationFailed {
            pid,
            reason: err.to_string(),
        })?;
    child
        .wait()
        .map_err(|err| LauncherError::ForcedTerminationFailed {
            pid,
            reason: err.to_string(),
        })?;
    Ok(StopOutcome::Forced)
}

fn terminate_pid(pid: u32, settings: &SupervisorSettings) -> Result<StopOutcome> {
    if !process_is_alive(pid) {
        return Ok(StopOutcome::Exited);
    }
    if request_termination(pid) && wait_for_exit(pid, settings.grace_period, settings.poll_interval) {
        return Ok(StopOutcome::Graceful);
    }
    warn!(pid, "forcing termination of locking process");
    force_kill(pid)?;
    if wait_for_exit(pid, KILL_CONFIRM_TIMEOUT, settings.poll_interval) {
        Ok(StopOutcome::Forced)
    } else {
        Err(LauncherError::ForcedTerminationFailed {
            pid,
            reason: "process still alive after forced kill".to_string(),
        })
    }
}

fn wait_for_exit(pid: u32, limit: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !process_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(poll);
    }
}

#[cfg(unix)]
fn request_termination(pid: u32) -> bool {
    // SAFETY: kill(2) with a concrete pid has no memory-safety preconditions.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_termination(pid: u32) -> bool {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<()> {
    // SAFETY: as above.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(LauncherError::ForcedTerminationFailed {
        pid,
        reason: err.to_string(),
    })
}

#[cfg(not(unix))]
fn force_kill(pid: u32) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(LauncherError::ForcedTerminationFailed {
            pid,
            reason: format!("taskkill exited with {status}"),
        })
    }
}

#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the permission and existence check.
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
        || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map(|state| state == 'Z')
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn process_command_line(pid: u32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(String::from_utf8_lossy(&raw).replace('\0', " "))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_command_line(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(not(unix))]
fn process_command_line(_pid: u32) -> Option<String> {
    None
}

fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

#[cfg(unix)]
fn port_owner(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-t", "-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

#[cfg(not(unix))]
fn port_owner(_port: u16) -> Option<u32> {
    None
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
