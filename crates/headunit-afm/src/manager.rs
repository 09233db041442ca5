//! Lifecycle facade.
//!
//! One task owns the registry, the supervisor and every timer callback.
//! RPC calls arrive as [`Command`]s; process events, kill deadlines, restart
//! and autostart timers arrive as [`InternalMsg`]s. Both are handled on the
//! same task, so per-application transitions are strictly ordered and no
//! state is shared behind a lock.

use std::time::Duration;

use headunit_lifecycle::{
    AppId, AppState, AppStatus, LifecycleEvent, ResumeTarget, RunId,
    machine::{Outcome, Trigger, decide},
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::{AfmConfig, AutostartConfig};
use crate::environment::EnvironmentBuilder;
use crate::handle::AfmHandle;
use crate::registry::Registry;
use crate::restart::RestartConfig;
use crate::supervisor::{ProcessEvent, ProcessSupervisor};
use crate::watchdog;

const COMMAND_QUEUE: usize = 256;
const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
pub(crate) enum Command {
    Launch(AppId),
    Activate(AppId),
    Terminate(AppId),
    Pause(AppId),
    Resume(AppId),
    Connected(AppId),
    Disconnected(AppId),
    LaunchInitial,
    GetState {
        id: AppId,
        reply: oneshot::Sender<Option<AppState>>,
    },
    RunningApps {
        reply: oneshot::Sender<Vec<AppId>>,
    },
    ListApps {
        reply: oneshot::Sender<Vec<AppStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub(crate) enum InternalMsg {
    Process {
        id: AppId,
        run_id: RunId,
        event: ProcessEvent,
    },
    KillDeadline {
        id: AppId,
        run_id: RunId,
    },
    RestartDue {
        id: AppId,
        token: u64,
    },
    Autostart {
        attempt: u32,
    },
    DelayedLaunch {
        id: AppId,
    },
}

/// Delivers `msg` back to the control task after `delay` without blocking it.
pub(crate) fn schedule(
    tx: &mpsc::UnboundedSender<InternalMsg>,
    delay: Duration,
    msg: InternalMsg,
) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(msg);
    });
}

/// Starts the control task and returns the handle used by every caller.
pub(crate) fn spawn(cfg: &AfmConfig, registry: Registry) -> AfmHandle {
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (manager, internal_rx) = AppManager::new(cfg, registry, events.clone());
    tokio::spawn(manager.run(cmd_rx, internal_rx));
    AfmHandle::new(cmd_tx, events)
}

pub(crate) struct AppManager {
    registry: Registry,
    supervisor: ProcessSupervisor,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    events: broadcast::Sender<LifecycleEvent>,
    watchdog_interval: Duration,
    stop_grace: Duration,
    autostart: AutostartConfig,
    autostart_in_progress: bool,
    resume_target: ResumeTarget,
    restart: RestartConfig,
    next_restart_token: u64,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl AppManager {
    pub(crate) fn new(
        cfg: &AfmConfig,
        registry: Registry,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<InternalMsg>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            cfg.search_paths.clone(),
            EnvironmentBuilder::new(cfg.wayland_socket.clone())
                .with_runtime_dir(cfg.runtime_dir.clone()),
            Some(cfg.run_dir.clone()),
            internal_tx.clone(),
        );
        let manager = Self {
            registry,
            supervisor,
            internal_tx,
            events,
            watchdog_interval: cfg.watchdog_interval,
            stop_grace: cfg.stop_grace,
            autostart: cfg.autostart.clone(),
            autostart_in_progress: false,
            resume_target: cfg.resume_target,
            restart: cfg.restart,
            next_restart_token: 1,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };
        (manager, internal_rx)
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<InternalMsg>,
    ) {
        tracing::info!(
            apps = self.registry.len(),
            watchdog_ms = self.watchdog_interval.as_millis() as u64,
            "lifecycle manager started"
        );

        if self.autostart.enabled {
            self.autostart_in_progress = true;
            schedule(
                &self.internal_tx,
                self.autostart.delay,
                InternalMsg::Autostart { attempt: 1 },
            );
        }

        let mut watchdog = tokio::time::interval(self.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        watchdog.tick().await;

        let mut commands_closed = false;
        loop {
            if self.shutting_down && !self.any_live() {
                break;
            }

            tokio::select! {
                biased;

                Some(msg) = internal.recv() => self.handle_internal(msg),

                maybe_cmd = commands.recv(), if !commands_closed => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        tracing::info!("all handles dropped; stopping applications");
                        commands_closed = true;
                        self.begin_shutdown();
                    }
                },

                _ = watchdog.tick() => self.watchdog_sweep(),
            }
        }

        tracing::info!("all applications stopped; lifecycle manager exiting");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Launch(id) => self.dispatch(id, Trigger::Launch),
            Command::Activate(id) => self.dispatch(id, Trigger::Activate),
            Command::Terminate(id) => self.dispatch(id, Trigger::Terminate),
            Command::Pause(id) => self.dispatch(id, Trigger::Pause),
            Command::Resume(id) => self.dispatch(id, Trigger::Resume(self.resume_target)),
            Command::Connected(id) => self.dispatch(id, Trigger::Connected),
            Command::Disconnected(id) => self.dispatch(id, Trigger::Disconnected),
            Command::LaunchInitial => {
                if self.autostart_in_progress {
                    tracing::info!("initial launch already in progress");
                } else {
                    self.autostart_in_progress = true;
                    self.launch_initial_apps(1);
                }
            }
            Command::GetState { id, reply } => {
                let _ = reply.send(self.registry.get(id).map(|r| r.state));
            }
            Command::RunningApps { reply } => {
                let _ = reply.send(self.running_apps());
            }
            Command::ListApps { reply } => {
                let _ = reply.send(self.registry.iter().map(|r| r.status()).collect());
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn handle_internal(&mut self, msg: InternalMsg) {
        match msg {
            InternalMsg::Process { id, run_id, event } => self.on_process_event(id, run_id, event),
            InternalMsg::KillDeadline { id, run_id } => {
                if let Some(rec) = self.registry.get_mut(id) {
                    self.supervisor.force_kill(rec, run_id);
                }
            }
            InternalMsg::RestartDue { id, token } => self.on_restart_due(id, token),
            InternalMsg::Autostart { attempt } => self.launch_initial_apps(attempt),
            InternalMsg::DelayedLaunch { id } => self.launch_if_stopped(id),
        }
    }

    fn running_apps(&self) -> Vec<AppId> {
        self.registry
            .iter()
            .filter(|r| r.state.is_live())
            .map(|r| r.id)
            .collect()
    }

    fn any_live(&self) -> bool {
        self.registry.iter().any(|r| r.state.is_live())
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Applies a state change and emits exactly one `StateChanged` for it.
    fn set_state(&mut self, id: AppId, new: AppState) -> bool {
        let Some(rec) = self.registry.get_mut(id) else {
            return false;
        };
        let old = rec.state;
        if old == new {
            return false;
        }
        rec.state = new;
        tracing::info!(app_id = %id, app = %rec.name, %old, %new, "state changed");
        self.emit(LifecycleEvent::StateChanged { id, old, new });
        true
    }

    fn dispatch(&mut self, id: AppId, trigger: Trigger) {
        let Some(state) = self.registry.get(id).map(|r| r.state) else {
            tracing::warn!(app_id = %id, ?trigger, "unknown application id; ignoring");
            return;
        };

        if trigger == Trigger::Terminate
            && let Some(rec) = self.registry.get_mut(id)
            && let Some(token) = rec.pending_restart.take()
        {
            tracing::info!(app_id = %id, token, "terminate cancels pending restart");
        }

        match decide(state, trigger) {
            Outcome::Transition(next) => match trigger {
                Trigger::Launch => self.start_launch(id, false),
                Trigger::Terminate => self.discard_failed(id),
                Trigger::Pause => {
                    self.set_state(id, next);
                    self.emit(LifecycleEvent::Paused { id });
                }
                Trigger::Resume(_) => {
                    self.set_state(id, next);
                    self.emit(LifecycleEvent::Resumed { id });
                }
                _ => {
                    self.set_state(id, next);
                }
            },
            Outcome::RedirectActivate => {
                tracing::info!(app_id = %id, %state, "already running; activating instead");
                self.dispatch(id, Trigger::Activate);
            }
            Outcome::RedirectLaunch => {
                tracing::info!(app_id = %id, %state, "not running; launching");
                self.dispatch(id, Trigger::Launch);
            }
            Outcome::RedirectResume => {
                tracing::info!(app_id = %id, ?trigger, "paused; resuming");
                self.dispatch(id, Trigger::Resume(self.resume_target));
            }
            Outcome::StopProcess => {
                let grace = self.stop_grace;
                let Some(rec) = self.registry.get_mut(id) else {
                    return;
                };
                if !self.supervisor.stop(rec, grace) {
                    tracing::debug!(app_id = %id, "process already gone; awaiting exit event");
                }
            }
            Outcome::DeferStop => {
                if let Some(rec) = self.registry.get_mut(id) {
                    tracing::info!(app_id = %id, "terminate during launch; stopping once started");
                    rec.stop_on_start = true;
                }
            }
            Outcome::Ignore(reason) => {
                tracing::info!(app_id = %id, %state, ?trigger, reason, "no-op");
            }
            Outcome::Reject(reason) => {
                tracing::warn!(app_id = %id, %state, ?trigger, reason, "request rejected");
            }
        }
    }

    fn start_launch(&mut self, id: AppId, from_restart: bool) {
        if self.shutting_down {
            tracing::warn!(app_id = %id, "shutdown in progress; launch refused");
            return;
        }
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        if !from_restart {
            rec.restart_attempts = 0;
        }
        rec.pending_restart = None;
        rec.stop_on_start = false;

        if let Some(old) = rec.process.as_ref().filter(|p| p.is_running()) {
            tracing::error!(
                app_id = %id,
                run_id = %old.run_id,
                pid = ?old.pid,
                "previous process still alive; terminate it before launching again"
            );
            return;
        }

        let exe = match self.supervisor.resolve_executable(rec) {
            Ok(exe) => exe,
            Err(err) => {
                tracing::error!(app_id = %id, app = %rec.name, error = %err, "launch aborted");
                return;
            }
        };

        self.set_state(id, AppState::Launching);
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        match self.supervisor.start(rec, &exe) {
            Ok(run_id) => {
                tracing::info!(app_id = %id, %run_id, exec = %exe.display(), "process spawned");
            }
            Err(err) => {
                tracing::error!(app_id = %id, error = %err, "failed to start process");
                let outcome = decide(AppState::Launching, Trigger::SpawnFailed);
                if let Outcome::Transition(next) = outcome {
                    self.set_state(id, next);
                }
            }
        }
    }

    /// Terminate on `error`/`crashed`: drop whatever handle is left and settle
    /// on `stopped`. A process that survives the kill keeps its handle, and
    /// the record stays where it is.
    fn discard_failed(&mut self, id: AppId) {
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        if !self.supervisor.kill_now(rec) {
            tracing::error!(
                app_id = %id,
                state = %rec.state,
                pid = ?rec.process.as_ref().and_then(|p| p.pid),
                "process could not be killed; keeping its handle"
            );
            return;
        }
        rec.process = None;
        rec.pid = None;
        rec.run_id = None;
        if self.set_state(id, AppState::Stopped) {
            self.emit(LifecycleEvent::Terminated { id });
        }
    }

    fn launch_if_stopped(&mut self, id: AppId) {
        match self.registry.get(id).map(|r| r.state) {
            Some(state) if state.is_launchable() => self.dispatch(id, Trigger::Launch),
            Some(state) => {
                tracing::info!(app_id = %id, %state, "skipping initial launch; already live");
            }
            None => {}
        }
    }

    fn on_process_event(&mut self, id: AppId, run_id: RunId, event: ProcessEvent) {
        let current = self
            .registry
            .get(id)
            .and_then(|r| r.process.as_ref())
            .map(|p| p.run_id);
        if current != Some(run_id) {
            tracing::debug!(app_id = %id, %run_id, ?event, "event from a previous run; ignoring");
            return;
        }

        match event {
            ProcessEvent::StateChanged(phase) => {
                tracing::debug!(app_id = %id, %run_id, ?phase, "process phase");
            }
            ProcessEvent::Started { pid } => self.on_started(id, run_id, pid),
            ProcessEvent::Exited { code, crashed } => self.on_exited(id, run_id, code, crashed),
            ProcessEvent::Error { kind, message } => {
                tracing::error!(app_id = %id, %run_id, ?kind, %message, "process error");
                if let Some(rec) = self.registry.get_mut(id) {
                    rec.pid = None;
                    let state = rec.state;
                    if let Outcome::Transition(next) = decide(state, Trigger::ProcessError) {
                        self.set_state(id, next);
                    }
                }
            }
        }
    }

    fn on_started(&mut self, id: AppId, run_id: RunId, pid: Option<u32>) {
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        rec.pid = pid;
        let state = rec.state;
        tracing::info!(app_id = %id, %run_id, pid = ?pid, "process started");

        match decide(state, Trigger::ProcessStarted) {
            Outcome::Transition(next) => {
                self.set_state(id, next);
            }
            other => tracing::debug!(app_id = %id, %state, ?other, "started event"),
        }
        self.emit(LifecycleEvent::Launched { id, run_id });

        let grace = self.stop_grace;
        if let Some(rec) = self.registry.get_mut(id)
            && rec.stop_on_start
        {
            rec.stop_on_start = false;
            tracing::info!(app_id = %id, %run_id, "applying terminate requested during launch");
            if let Some(handle) = rec.process.as_mut() {
                // Covers a process that exits on its own before the signal.
                handle.stop_requested = true;
            }
            self.supervisor.stop(rec, grace);
        }
    }

    fn on_exited(&mut self, id: AppId, run_id: RunId, code: Option<i32>, crashed: bool) {
        let stable_run = self.restart.stable_run;
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        let Some(handle) = rec.process.take() else {
            return;
        };
        let ran_for = handle.started.elapsed();
        let failed = crashed || code != Some(0);

        if crashed {
            tracing::warn!(
                app_id = %id,
                %run_id,
                ran_ms = ran_for.as_millis() as u64,
                "process killed by signal"
            );
        } else if failed {
            tracing::warn!(app_id = %id, %run_id, code = ?code, "process exited with failure");
        } else {
            tracing::info!(app_id = %id, %run_id, "process exited cleanly");
        }

        rec.pid = None;
        rec.run_id = None;
        rec.stop_on_start = false;
        if ran_for >= stable_run {
            rec.restart_attempts = 0;
        }
        let state = rec.state;

        if let Outcome::Transition(next) = decide(state, Trigger::ProcessExited)
            && self.set_state(id, next)
        {
            self.emit(LifecycleEvent::Terminated { id });
        }

        if handle.stop_requested || self.shutting_down {
            return;
        }
        self.consider_restart(id, failed);
    }

    fn consider_restart(&mut self, id: AppId, failed: bool) {
        let restart = self.restart;
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        if rec.pending_restart.is_some() {
            return;
        }
        match restart.next_delay(failed, rec.restart_attempts) {
            Some(delay) => {
                rec.restart_attempts += 1;
                let token = self.next_restart_token;
                self.next_restart_token += 1;
                rec.pending_restart = Some(token);
                tracing::warn!(
                    app_id = %id,
                    attempt = rec.restart_attempts,
                    max = restart.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling restart"
                );
                schedule(
                    &self.internal_tx,
                    delay,
                    InternalMsg::RestartDue { id, token },
                );
            }
            None if failed => {
                tracing::warn!(app_id = %id, attempts = rec.restart_attempts, "not restarting");
            }
            None => {}
        }
    }

    fn on_restart_due(&mut self, id: AppId, token: u64) {
        let Some(rec) = self.registry.get_mut(id) else {
            return;
        };
        if rec.pending_restart != Some(token) {
            return;
        }
        rec.pending_restart = None;
        if self.shutting_down || !rec.state.is_launchable() {
            tracing::debug!(app_id = %id, state = %rec.state, "restart no longer applicable");
            return;
        }
        tracing::info!(app_id = %id, attempt = rec.restart_attempts, "restarting");
        self.start_launch(id, true);
    }

    pub(crate) fn watchdog_sweep(&mut self) {
        for id in watchdog::sweep(&self.registry) {
            let Some(rec) = self.registry.get_mut(id) else {
                continue;
            };
            let state = rec.state;
            tracing::warn!(
                app_id = %id,
                %state,
                pid = ?rec.pid,
                "process not running but state says live; correcting"
            );
            rec.pid = None;
            let stop_requested = rec.process.as_ref().is_some_and(|p| p.stop_requested);
            if let Outcome::Transition(next) = decide(state, Trigger::WatchdogDrift) {
                self.set_state(id, next);
            }
            if !stop_requested && !self.shutting_down {
                self.consider_restart(id, true);
            }
        }
    }

    fn launch_initial_apps(&mut self, attempt: u32) {
        if self.shutting_down {
            self.autostart_in_progress = false;
            return;
        }

        let ready = self.supervisor.environment().compositor_socket().is_some();
        if !ready && attempt <= self.autostart.max_attempts {
            tracing::info!(
                attempt,
                max = self.autostart.max_attempts,
                retry_ms = self.autostart.retry.as_millis() as u64,
                "compositor not ready; retrying initial launch"
            );
            schedule(
                &self.internal_tx,
                self.autostart.retry,
                InternalMsg::Autostart {
                    attempt: attempt + 1,
                },
            );
            return;
        }
        if ready {
            tracing::info!("compositor ready; launching initial applications");
        } else {
            tracing::warn!("compositor never appeared; launching initial applications standalone");
        }
        self.autostart_in_progress = false;

        let ids: Vec<AppId> = self
            .registry
            .iter()
            .filter(|r| r.autostart)
            .map(|r| r.id)
            .collect();
        for (i, id) in ids.into_iter().enumerate() {
            if i == 0 {
                self.launch_if_stopped(id);
            } else {
                schedule(
                    &self.internal_tx,
                    self.autostart.stagger * i as u32,
                    InternalMsg::DelayedLaunch { id },
                );
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            tracing::info!(
                live = self.running_apps().len(),
                "shutting down; stopping all applications"
            );
        }
        self.shutting_down = true;

        let grace = self.stop_grace;
        let mut vanished = Vec::new();
        for id in self.registry.ids() {
            let Some(rec) = self.registry.get_mut(id) else {
                continue;
            };
            rec.pending_restart = None;
            rec.stop_on_start = false;
            let running = rec.process.as_ref().is_some_and(|p| p.is_running());
            let exit_pending = rec.process.as_ref().is_some_and(|p| p.exit_pending());
            if running {
                self.supervisor.stop(rec, grace);
            } else if !exit_pending && rec.state.is_live() {
                vanished.push(id);
            }
        }
        for id in vanished {
            if let Some(rec) = self.registry.get_mut(id) {
                rec.pid = None;
            }
            self.set_state(id, AppState::Crashed);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::handle::AppLifecycle;
    use crate::registry::{SeedEntry, tests::write_executable};
    use crate::restart::RestartPolicy;
    use crate::supervisor::ProcessHandle;
    use tokio::sync::broadcast::error::TryRecvError;

    fn seed(id: u32, name: &str, autostart: bool) -> SeedEntry {
        SeedEntry {
            id,
            name: name.to_string(),
            display_name: None,
            role: None,
            autostart,
            binary: None,
        }
    }

    fn config(dir: &Path) -> AfmConfig {
        let mut cfg = AfmConfig::default();
        cfg.search_paths = vec![dir.to_path_buf()];
        cfg.run_dir = dir.join("run");
        cfg.stop_grace = Duration::from_millis(300);
        cfg.autostart.enabled = false;
        cfg.restart.policy = RestartPolicy::Off;
        cfg
    }

    async fn next(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("event channel closed")
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<LifecycleEvent>,
        pred: impl Fn(&LifecycleEvent) -> bool,
    ) -> LifecycleEvent {
        loop {
            let ev = next(rx).await;
            if pred(&ev) {
                return ev;
            }
        }
    }

    fn launched(id: u32) -> impl Fn(&LifecycleEvent) -> bool {
        move |ev| matches!(ev, LifecycleEvent::Launched { id: got, .. } if got.0 == id)
    }

    fn terminated(id: u32) -> impl Fn(&LifecycleEvent) -> bool {
        move |ev| matches!(ev, LifecycleEvent::Terminated { id: got } if got.0 == id)
    }

    const SLEEPER: &str = "#!/bin/sh\nexec sleep 30\n";

    #[tokio::test]
    async fn launch_reports_launching_running_and_first_run_id() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::StateChanged {
                id: AppId(1001),
                old: AppState::Stopped,
                new: AppState::Launching
            }
        );
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::StateChanged {
                id: AppId(1001),
                old: AppState::Launching,
                new: AppState::Running
            }
        );
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::Launched {
                id: AppId(1001),
                run_id: RunId(1)
            }
        );
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "running");
        assert_eq!(handle.get_running_apps().await.unwrap(), vec![AppId(1001)]);

        let status = handle.list_apps().await.unwrap();
        assert!(status[0].pid.is_some());
        assert_eq!(status[0].run_id, Some(RunId(1)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_launch_activates_instead_of_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        write_executable(
            dir.path(),
            "GearSelector",
            &format!(
                "#!/bin/sh\necho x >> '{}'\nexec sleep 30\n",
                counter.display()
            ),
        );
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, launched(1001)).await;
        handle.launch_app(AppId(1001)).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::StateChanged {
                id: AppId(1001),
                old: AppState::Running,
                new: AppState::Active
            }
        );
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "active");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let spawns = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(spawns.lines().count(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_kills_uncooperative_child_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(
            dir.path(),
            "GearSelector",
            "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 0.1; done\n",
        );
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, launched(1001)).await;
        handle.app_connected(AppId(1001)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        handle.terminate_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, terminated(1001)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn unknown_id_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(9999)).await.unwrap();
        handle.pause_app(AppId(9999)).await.unwrap();
        assert_eq!(handle.get_app_state(AppId(9999)).await.unwrap(), "unknown");
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn missing_binary_leaves_app_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1003, "ThemeColor", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1003)).await.unwrap();
        assert_eq!(handle.get_app_state(AppId(1003)).await.unwrap(), "stopped");
        assert!(handle.get_running_apps().await.unwrap().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn crash_clears_pid_and_relaunch_gets_fresh_run_id() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(
            dir.path(),
            "MediaPlayer",
            "#!/bin/sh\nsleep 0.2\nkill -9 $$\n",
        );
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1002, "MediaPlayer", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1002)).await.unwrap();
        let first = wait_for(&mut rx, launched(1002)).await;
        wait_for(&mut rx, terminated(1002)).await;

        let status = handle.list_apps().await.unwrap();
        assert_eq!(status[0].state, AppState::Stopped);
        assert!(status[0].pid.is_none());
        assert!(status[0].run_id.is_none());

        handle.launch_app(AppId(1002)).await.unwrap();
        let second = wait_for(&mut rx, launched(1002)).await;
        match (first, second) {
            (
                LifecycleEvent::Launched { run_id: a, .. },
                LifecycleEvent::Launched { run_id: b, .. },
            ) => assert!(b > a),
            other => panic!("unexpected events: {other:?}"),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_resume_emit_their_notifications() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "Navigation", SLEEPER);
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1004, "Navigation", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1004)).await.unwrap();
        wait_for(&mut rx, launched(1004)).await;
        handle.app_connected(AppId(1004)).await.unwrap();
        handle.pause_app(AppId(1004)).await.unwrap();
        // Second pause is rejected without a notification.
        handle.pause_app(AppId(1004)).await.unwrap();
        handle.resume_app(AppId(1004)).await.unwrap();
        assert_eq!(handle.get_app_state(AppId(1004)).await.unwrap(), "active");

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        let id = AppId(1004);
        assert_eq!(
            seen,
            vec![
                LifecycleEvent::StateChanged {
                    id,
                    old: AppState::Running,
                    new: AppState::Active
                },
                LifecycleEvent::StateChanged {
                    id,
                    old: AppState::Active,
                    new: AppState::Paused
                },
                LifecycleEvent::Paused { id },
                LifecycleEvent::StateChanged {
                    id,
                    old: AppState::Paused,
                    new: AppState::Active
                },
                LifecycleEvent::Resumed { id },
            ]
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_does_not_change_state() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "Settings", SLEEPER);
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1005, "Settings", false)]),
        );
        let mut rx = handle.subscribe();

        handle.activate_app(AppId(1005)).await.unwrap();
        wait_for(&mut rx, launched(1005)).await;
        handle.app_connected(AppId(1005)).await.unwrap();
        handle.app_disconnected(AppId(1005)).await.unwrap();
        assert_eq!(handle.get_app_state(AppId(1005)).await.unwrap(), "active");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_while_launching_stops_once_started() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        let mut cfg = config(dir.path());
        cfg.restart.policy = RestartPolicy::Always;
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        handle.terminate_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, terminated(1001)).await;
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");

        // A requested stop never triggers a restart.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn failing_app_is_restarted_up_to_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        write_executable(
            dir.path(),
            "GearSelector",
            &format!("#!/bin/sh\necho x >> '{}'\nexit 1\n", counter.display()),
        );
        let mut cfg = config(dir.path());
        cfg.restart.policy = RestartPolicy::OnFailure;
        cfg.restart.max_retries = 2;
        cfg.restart.backoff_ms = 100;
        cfg.restart.backoff_max_ms = 200;
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        let mut runs = Vec::new();
        for _ in 0..3 {
            let ev = wait_for(&mut rx, launched(1001)).await;
            if let LifecycleEvent::Launched { run_id, .. } = ev {
                runs.push(run_id);
            }
            wait_for(&mut rx, terminated(1001)).await;
        }
        assert!(runs.windows(2).all(|w| w[0] < w[1]));

        tokio::time::sleep(Duration::from_millis(800)).await;
        let spawns = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(spawns.lines().count(), 3);
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn autostart_launches_flagged_apps_in_standalone_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        write_executable(dir.path(), "MediaPlayer", SLEEPER);
        write_executable(dir.path(), "Navigation", SLEEPER);
        let mut cfg = config(dir.path());
        cfg.wayland_socket = "wayland-does-not-exist-for-tests".to_string();
        cfg.autostart.enabled = true;
        cfg.autostart.delay = Duration::ZERO;
        cfg.autostart.max_attempts = 0;
        cfg.autostart.stagger = Duration::from_millis(50);
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![
                seed(1001, "GearSelector", true),
                seed(1002, "MediaPlayer", true),
                seed(1004, "Navigation", false),
            ]),
        );
        let mut rx = handle.subscribe();

        wait_for(&mut rx, launched(1001)).await;
        wait_for(&mut rx, launched(1002)).await;
        let mut running = handle.get_running_apps().await.unwrap();
        running.sort();
        assert_eq!(running, vec![AppId(1001), AppId(1002)]);
        assert_eq!(handle.get_app_state(AppId(1004)).await.unwrap(), "stopped");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_every_live_app() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        write_executable(dir.path(), "MediaPlayer", SLEEPER);
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![
                seed(1001, "GearSelector", false),
                seed(1002, "MediaPlayer", false),
            ]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        handle.launch_app(AppId(1002)).await.unwrap();
        wait_for(&mut rx, launched(1001)).await;
        wait_for(&mut rx, launched(1002)).await;

        tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();

        let mut terminated_ids = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let LifecycleEvent::Terminated { id } = ev {
                terminated_ids.push(id);
            }
        }
        terminated_ids.sort();
        assert_eq!(terminated_ids, vec![AppId(1001), AppId(1002)]);
        assert!(handle.get_app_state(AppId(1001)).await.is_err());
    }

    #[tokio::test]
    async fn watchdog_marks_vanished_process_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let mut cfg = config(dir.path());
        cfg.restart.policy = RestartPolicy::OnFailure;
        let (mut manager, _internal) = AppManager::new(
            &cfg,
            Registry::from_seed(vec![seed(1002, "MediaPlayer", false)]),
            events,
        );
        {
            let rec = manager.registry.get_mut(AppId(1002)).unwrap();
            rec.state = AppState::Active;
            rec.pid = Some(4242);
            rec.process = Some(ProcessHandle::vanished(RunId(7)));
        }

        manager.watchdog_sweep();

        let rec = manager.registry.get(AppId(1002)).unwrap();
        assert_eq!(rec.state, AppState::Crashed);
        assert!(rec.pid.is_none());
        assert!(rec.process.is_some());
        assert!(rec.pending_restart.is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::StateChanged {
                id: AppId(1002),
                old: AppState::Active,
                new: AppState::Crashed
            }
        );

        // A second sweep finds nothing left to correct.
        manager.watchdog_sweep();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn terminate_on_crashed_settles_on_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let (mut manager, _internal) = AppManager::new(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1002, "MediaPlayer", false)]),
            events,
        );
        {
            let rec = manager.registry.get_mut(AppId(1002)).unwrap();
            rec.state = AppState::Crashed;
            rec.process = Some(ProcessHandle::vanished(RunId(3)));
        }

        manager.dispatch(AppId(1002), Trigger::Terminate);

        let rec = manager.registry.get(AppId(1002)).unwrap();
        assert_eq!(rec.state, AppState::Stopped);
        assert!(rec.process.is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            LifecycleEvent::StateChanged { .. }
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::Terminated { id: AppId(1002) }
        );
    }

    #[tokio::test]
    async fn terminate_cancels_scheduled_restart() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        write_executable(
            dir.path(),
            "GearSelector",
            &format!("#!/bin/sh\necho x >> '{}'\nexit 1\n", counter.display()),
        );
        let mut cfg = config(dir.path());
        cfg.restart.policy = RestartPolicy::OnFailure;
        cfg.restart.backoff_ms = 800;
        cfg.restart.backoff_max_ms = 800;
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, terminated(1001)).await;
        handle.terminate_app(AppId(1001)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let spawns = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(spawns.lines().count(), 1);
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn unkillable_process_keeps_its_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let (mut manager, _internal) = AppManager::new(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
            events,
        );
        {
            let rec = manager.registry.get_mut(AppId(1001)).unwrap();
            rec.state = AppState::Error;
            rec.run_id = Some(RunId(5));
            rec.process = Some(ProcessHandle::unsignallable(RunId(5)));
        }

        manager.dispatch(AppId(1001), Trigger::Terminate);
        let rec = manager.registry.get(AppId(1001)).unwrap();
        assert_eq!(rec.state, AppState::Error);
        assert_eq!(rec.process.as_ref().map(|p| p.run_id), Some(RunId(5)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // The surviving child still blocks a second spawn.
        manager.dispatch(AppId(1001), Trigger::Launch);
        let rec = manager.registry.get(AppId(1001)).unwrap();
        assert_eq!(rec.state, AppState::Error);
        assert_eq!(rec.process.as_ref().map(|p| p.run_id), Some(RunId(5)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn spawn_failure_reverts_launching_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", "#!/nonexistent/interpreter\n");
        let handle = spawn(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::StateChanged {
                id: AppId(1001),
                old: AppState::Stopped,
                new: AppState::Launching
            }
        );
        assert_eq!(
            next(&mut rx).await,
            LifecycleEvent::StateChanged {
                id: AppId(1001),
                old: AppState::Launching,
                new: AppState::Stopped
            }
        );
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
        let status = handle.list_apps().await.unwrap();
        assert!(status[0].run_id.is_none());
        assert!(status[0].pid.is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn late_exit_settles_watchdog_crash_on_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let (mut manager, _internal) = AppManager::new(
            &config(dir.path()),
            Registry::from_seed(vec![seed(1002, "MediaPlayer", false)]),
            events,
        );
        {
            let rec = manager.registry.get_mut(AppId(1002)).unwrap();
            rec.state = AppState::Running;
            rec.run_id = Some(RunId(4));
            rec.process = Some(ProcessHandle::vanished(RunId(4)));
        }

        manager.watchdog_sweep();
        manager.handle_internal(InternalMsg::Process {
            id: AppId(1002),
            run_id: RunId(4),
            event: ProcessEvent::Exited {
                code: None,
                crashed: true,
            },
        });

        let id = AppId(1002);
        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![
                LifecycleEvent::StateChanged {
                    id,
                    old: AppState::Running,
                    new: AppState::Crashed
                },
                LifecycleEvent::StateChanged {
                    id,
                    old: AppState::Crashed,
                    new: AppState::Stopped
                },
                LifecycleEvent::Terminated { id },
            ]
        );
        let rec = manager.registry.get(id).unwrap();
        assert!(rec.process.is_none());
        assert!(rec.run_id.is_none());
    }

    #[tokio::test]
    async fn each_run_writes_run_json() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        let mut cfg = config(dir.path());
        cfg.runtime_dir = Some(dir.path().join("xdg"));
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1001, "GearSelector", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1001)).await.unwrap();
        wait_for(&mut rx, launched(1001)).await;
        let pid = handle.list_apps().await.unwrap()[0].pid.unwrap();

        let run_dir = dir.path().join("run").join("GearSelector");
        let path = run_dir.join("run.json");
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let info: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(info["app_id"], 1001);
        assert_eq!(info["name"], "GearSelector");
        assert_eq!(info["run_id"], 1);
        assert_eq!(info["pid"], pid);
        assert_eq!(info["mode"], "eglfs");
        assert_eq!(info["env"]["QT_QPA_PLATFORM"], "eglfs");
        assert!(!run_dir.join("run.json.tmp").exists());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn autostart_waits_for_compositor_socket() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "GearSelector", SLEEPER);
        let runtime = dir.path().join("xdg");
        std::fs::create_dir_all(&runtime).unwrap();
        let mut cfg = config(dir.path());
        cfg.runtime_dir = Some(runtime.clone());
        cfg.wayland_socket = "wayland-7".to_string();
        cfg.autostart.enabled = true;
        cfg.autostart.delay = Duration::ZERO;
        cfg.autostart.retry = Duration::from_millis(100);
        cfg.autostart.max_attempts = 100;
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1001, "GearSelector", true)]),
        );
        let mut rx = handle.subscribe();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.get_app_state(AppId(1001)).await.unwrap(), "stopped");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        std::fs::write(runtime.join("wayland-7"), b"").unwrap();
        wait_for(&mut rx, launched(1001)).await;
        assert_eq!(handle.get_running_apps().await.unwrap(), vec![AppId(1001)]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stable_run_resets_restart_attempts() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "MediaPlayer", "#!/bin/sh\nsleep 0.4\nexit 1\n");
        let mut cfg = config(dir.path());
        cfg.restart.policy = RestartPolicy::OnFailure;
        cfg.restart.max_retries = 1;
        cfg.restart.backoff_ms = 100;
        cfg.restart.backoff_max_ms = 100;
        cfg.restart.stable_run = Duration::from_millis(200);
        let handle = spawn(
            &cfg,
            Registry::from_seed(vec![seed(1002, "MediaPlayer", false)]),
        );
        let mut rx = handle.subscribe();

        handle.launch_app(AppId(1002)).await.unwrap();
        // One retry allowed, yet every stable run earns a fresh one.
        for _ in 0..3 {
            wait_for(&mut rx, launched(1002)).await;
        }
        handle.terminate_app(AppId(1002)).await.unwrap();
        handle.shutdown().await.unwrap();
    }
}
