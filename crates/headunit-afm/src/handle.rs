use headunit_lifecycle::{AppId, AppStatus, LifecycleEvent};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::manager::Command;

/// Returned to callers once the control task has exited.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("lifecycle manager is not running")]
pub(crate) struct ManagerGone;

/// Facade operations. Transports forward into this and hold no logic of
/// their own; fire-and-forget calls succeed once the request is queued.
#[tonic::async_trait]
pub(crate) trait AppLifecycle: Send + Sync + 'static {
    async fn launch_app(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn activate_app(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn terminate_app(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn pause_app(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn resume_app(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn app_connected(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn app_disconnected(&self, id: AppId) -> Result<(), ManagerGone>;
    async fn launch_initial_apps(&self) -> Result<(), ManagerGone>;

    /// Lowercase state name, or `"unknown"` for an unregistered id.
    async fn get_app_state(&self, id: AppId) -> Result<String, ManagerGone>;
    /// Ids in a live state (launching, running, active, paused). Records in
    /// `error` or `crashed` are not stopped yet are still excluded, since no
    /// process is known to back them.
    async fn get_running_apps(&self) -> Result<Vec<AppId>, ManagerGone>;
    async fn list_apps(&self) -> Result<Vec<AppStatus>, ManagerGone>;

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

#[derive(Debug, Clone)]
pub(crate) struct AfmHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl AfmHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self { commands, events }
    }

    async fn send(&self, cmd: Command) -> Result<(), ManagerGone> {
        self.commands.send(cmd).await.map_err(|_| ManagerGone)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerGone> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| ManagerGone)
    }

    /// Stops every live application and resolves once the control task exits.
    pub(crate) async fn shutdown(&self) -> Result<(), ManagerGone> {
        self.ask(|reply| Command::Shutdown { reply }).await
    }
}

#[tonic::async_trait]
impl AppLifecycle for AfmHandle {
    async fn launch_app(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Launch(id)).await
    }

    async fn activate_app(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Activate(id)).await
    }

    async fn terminate_app(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Terminate(id)).await
    }

    async fn pause_app(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Pause(id)).await
    }

    async fn resume_app(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Resume(id)).await
    }

    async fn app_connected(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Connected(id)).await
    }

    async fn app_disconnected(&self, id: AppId) -> Result<(), ManagerGone> {
        self.send(Command::Disconnected(id)).await
    }

    async fn launch_initial_apps(&self) -> Result<(), ManagerGone> {
        self.send(Command::LaunchInitial).await
    }

    async fn get_app_state(&self, id: AppId) -> Result<String, ManagerGone> {
        let state = self.ask(|reply| Command::GetState { id, reply }).await?;
        Ok(state.map_or("unknown", |s| s.as_str()).to_string())
    }

    async fn get_running_apps(&self) -> Result<Vec<AppId>, ManagerGone> {
        self.ask(|reply| Command::RunningApps { reply }).await
    }

    async fn list_apps(&self) -> Result<Vec<AppStatus>, ManagerGone> {
        self.ask(|reply| Command::ListApps { reply }).await
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}
