use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use anyhow::Context;
use headunit_lifecycle::{AppId, RunId};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::environment::{DisplayMode, EnvironmentBuilder};
use crate::manager::{InternalMsg, schedule};
use crate::registry::{AppRecord, executable_canonical, resolve_binary, unix_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessPhase {
    Starting,
    Running,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessErrorKind {
    /// Waiting on the child failed; its fate is unknown.
    WaitFailed,
    /// A termination signal could not be delivered.
    SignalFailed,
}

/// Events reported by a monitored child, tagged by the manager with the app
/// and run they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessEvent {
    Started { pid: Option<u32> },
    Exited { code: Option<i32>, crashed: bool },
    Error {
        kind: ProcessErrorKind,
        message: String,
    },
    StateChanged(ProcessPhase),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SupervisorError {
    #[error("binary not found for {name} in any search path")]
    BinaryNotFound { name: String },
    #[error("binary {} is missing or not executable", .path.display())]
    NotExecutable { path: PathBuf },
    #[error("spawn {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("app {id} already has a live process (pid {pid:?})")]
    AlreadyRunning { id: AppId, pid: Option<u32> },
}

/// Live child owned on behalf of one record.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) run_id: RunId,
    pub(crate) pid: Option<u32>,
    pgid: Option<i32>,
    exited: Arc<AtomicBool>,
    pub(crate) started: Instant,
    pub(crate) stop_requested: bool,
    #[cfg(test)]
    signals_denied: bool,
}

impl ProcessHandle {
    pub(crate) fn is_running(&self) -> bool {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }
        self.pid.is_some_and(pid_alive)
    }

    /// The monitor saw the exit; its event is on the way.
    pub(crate) fn exit_pending(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Handle whose process disappeared without the monitor noticing.
    #[cfg(test)]
    pub(crate) fn vanished(run_id: RunId) -> Self {
        Self {
            run_id,
            // Above any kernel pid_max, so never alive.
            pid: Some(i32::MAX as u32),
            pgid: None,
            exited: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            stop_requested: false,
            signals_denied: false,
        }
    }

    /// Handle for a live process this supervisor is not allowed to signal.
    #[cfg(test)]
    pub(crate) fn unsignallable(run_id: RunId) -> Self {
        Self {
            run_id,
            // The test process itself, so it always reads as alive.
            pid: Some(std::process::id()),
            pgid: None,
            exited: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            stop_requested: false,
            signals_denied: true,
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn signal(handle: &ProcessHandle, sig: libc::c_int) -> std::io::Result<()> {
    #[cfg(test)]
    if handle.signals_denied {
        return Err(std::io::Error::from_raw_os_error(libc::EPERM));
    }
    // Children lead their own session, so the whole group gets the signal.
    let target = match (handle.pgid, handle.pid) {
        (Some(pgid), _) => -pgid,
        (None, Some(pid)) => pid as i32,
        (None, None) => return Ok(()),
    };
    let rc = unsafe { libc::kill(target, sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(not(unix))]
fn signal(_handle: &ProcessHandle, _sig: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process signals require unix",
    ))
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, its children are terminated with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct RunInfo {
    app_id: u32,
    name: String,
    run_id: u64,
    started_at_unix_ms: u64,
    afm_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    exec: String,
    mode: DisplayMode,
    env: BTreeMap<String, String>,
}

async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create run dir")?;
    let path = dir.join("run.json");
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run.json.tmp")?;
    f.write_all(&data).await.context("write run.json.tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}

/// Owns and controls at most one child process per record.
#[derive(Debug)]
pub(crate) struct ProcessSupervisor {
    search_paths: Vec<PathBuf>,
    env: EnvironmentBuilder,
    run_dir: Option<PathBuf>,
    events: mpsc::UnboundedSender<InternalMsg>,
    next_run_id: u64,
}

impl ProcessSupervisor {
    pub(crate) fn new(
        search_paths: Vec<PathBuf>,
        env: EnvironmentBuilder,
        run_dir: Option<PathBuf>,
        events: mpsc::UnboundedSender<InternalMsg>,
    ) -> Self {
        Self {
            search_paths,
            env,
            run_dir,
            events,
            next_run_id: 1,
        }
    }

    pub(crate) fn environment(&self) -> &EnvironmentBuilder {
        &self.env
    }

    /// Resolves (and caches) the record's binary, then checks that the
    /// canonical target exists and is executable.
    pub(crate) fn resolve_executable(
        &self,
        record: &mut AppRecord,
    ) -> Result<PathBuf, SupervisorError> {
        if record.binary_path.is_none() {
            tracing::info!(
                app_id = %record.id,
                app = %record.name,
                "binary path not set; searching"
            );
            record.binary_path = resolve_binary(&record.name, &self.search_paths);
        }
        let Some(path) = record.binary_path.clone() else {
            return Err(SupervisorError::BinaryNotFound {
                name: record.name.clone(),
            });
        };
        executable_canonical(&path).ok_or(SupervisorError::NotExecutable { path })
    }

    pub(crate) fn start(
        &mut self,
        record: &mut AppRecord,
        exe: &Path,
    ) -> Result<RunId, SupervisorError> {
        if let Some(existing) = &record.process {
            if existing.is_running() {
                return Err(SupervisorError::AlreadyRunning {
                    id: record.id,
                    pid: existing.pid,
                });
            }
            tracing::debug!(
                app_id = %record.id,
                run_id = %existing.run_id,
                "dropping stale process handle"
            );
        }
        record.process = None;

        let launch_env = self.env.build(record.id);
        let mut cmd = Command::new(exe);
        cmd.envs(&launch_env.vars)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(
            app_id = %record.id,
            exec = %exe.display(),
            mode = ?launch_env.mode,
            "starting process"
        );
        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            path: exe.to_path_buf(),
            source,
        })?;

        let run_id = RunId(self.next_run_id);
        self.next_run_id = self.next_run_id.saturating_add(1);
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let now = SystemTime::now();

        record.process = Some(ProcessHandle {
            run_id,
            pid,
            pgid: pid.map(|p| p as i32),
            exited: exited.clone(),
            started: Instant::now(),
            stop_requested: false,
            #[cfg(test)]
            signals_denied: false,
        });
        record.run_id = Some(run_id);
        record.launched_at = Some(now);

        let id = record.id;
        let _ = self.events.send(InternalMsg::Process {
            id,
            run_id,
            event: ProcessEvent::StateChanged(ProcessPhase::Starting),
        });

        if let Some(out) = child.stdout.take() {
            let app = record.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "headunit_afm::app", app = %app, "[stdout] {line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let app = record.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "headunit_afm::app", app = %app, "[stderr] {line}");
                }
            });
        }

        if let Some(run_dir) = &self.run_dir {
            let dir = run_dir.join(&record.name);
            let info = RunInfo {
                app_id: id.0,
                name: record.name.clone(),
                run_id: run_id.0,
                started_at_unix_ms: unix_ms(now),
                afm_version: env!("CARGO_PKG_VERSION").to_string(),
                pid,
                exec: exe.display().to_string(),
                mode: launch_env.mode,
                env: launch_env.vars.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = write_run_json(&dir, &info).await {
                    tracing::debug!(error = %err, "failed to write run.json");
                }
            });
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let send = |event| {
                let _ = events.send(InternalMsg::Process { id, run_id, event });
            };
            send(ProcessEvent::StateChanged(ProcessPhase::Running));
            send(ProcessEvent::Started { pid });

            let event = match child.wait().await {
                Ok(status) => ProcessEvent::Exited {
                    code: status.code(),
                    // No exit code means the process was killed by a signal.
                    crashed: status.code().is_none(),
                },
                Err(err) => ProcessEvent::Error {
                    kind: ProcessErrorKind::WaitFailed,
                    message: format!("wait failed: {err}"),
                },
            };
            exited.store(true, Ordering::Release);
            send(ProcessEvent::StateChanged(ProcessPhase::NotRunning));
            send(event);
        });

        Ok(run_id)
    }

    /// Phase one of shutdown: SIGTERM now, SIGKILL when the grace timer fires
    /// unless the process exited first. Never blocks.
    pub(crate) fn stop(&self, record: &mut AppRecord, grace: Duration) -> bool {
        let id = record.id;
        let Some(handle) = record.process.as_mut() else {
            return false;
        };
        if !handle.is_running() {
            return false;
        }

        let first_request = !handle.stop_requested;
        handle.stop_requested = true;
        tracing::info!(
            app_id = %id,
            pid = ?handle.pid,
            grace_ms = grace.as_millis() as u64,
            "sending SIGTERM"
        );
        if let Err(err) = signal(handle, SIGTERM) {
            tracing::error!(app_id = %id, error = %err, "failed to deliver SIGTERM");
            let _ = self.events.send(InternalMsg::Process {
                id,
                run_id: handle.run_id,
                event: ProcessEvent::Error {
                    kind: ProcessErrorKind::SignalFailed,
                    message: format!("SIGTERM: {err}"),
                },
            });
        }

        if first_request {
            schedule(
                &self.events,
                grace,
                InternalMsg::KillDeadline {
                    id,
                    run_id: handle.run_id,
                },
            );
        }
        true
    }

    /// Phase two: SIGKILL if the same run is still alive.
    pub(crate) fn force_kill(&self, record: &mut AppRecord, run_id: RunId) -> bool {
        let Some(handle) = record.process.as_ref() else {
            return false;
        };
        if handle.run_id != run_id || !handle.is_running() {
            return false;
        }
        tracing::warn!(
            app_id = %record.id,
            pid = ?handle.pid,
            "grace period elapsed; sending SIGKILL"
        );
        match signal(handle, SIGKILL) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(app_id = %record.id, error = %err, "failed to deliver SIGKILL");
                false
            }
        }
    }

    /// Immediate kill without grace, used after an unrecoverable process error.
    ///
    /// Returns false only when a live process could not be signalled.
    pub(crate) fn kill_now(&self, record: &mut AppRecord) -> bool {
        let Some(handle) = record.process.as_mut() else {
            return true;
        };
        if !handle.is_running() {
            return true;
        }
        handle.stop_requested = true;
        match signal(handle, SIGKILL) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(app_id = %record.id, error = %err, "failed to deliver SIGKILL");
                false
            }
        }
    }
}
