use std::{collections::BTreeSet, pin::Pin};

use headunit_lifecycle::{AppId, AppStatus, LifecycleEvent};
use headunit_proto::afm_v1 as pb;
use headunit_proto::afm_v1::app_lifecycle_server::{
    AppLifecycle as AppLifecycleRpc, AppLifecycleServer,
};
use tokio_stream::{
    Stream, StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tonic::{Request, Response, Status};

use crate::handle::{AppLifecycle, ManagerGone};

type EventStream = Pin<Box<dyn Stream<Item = Result<pb::LifecycleEvent, Status>> + Send + 'static>>;

/// RPC adaptor: decodes requests and forwards them to the facade.
#[derive(Debug, Clone)]
pub(crate) struct LifecycleApi<F> {
    facade: F,
}

impl<F: AppLifecycle> LifecycleApi<F> {
    pub(crate) fn new(facade: F) -> Self {
        Self { facade }
    }
}

fn unavailable(err: ManagerGone) -> Status {
    Status::unavailable(err.to_string())
}

fn ack(result: Result<(), ManagerGone>) -> Result<Response<pb::Ack>, Status> {
    result.map_err(unavailable)?;
    Ok(Response::new(pb::Ack {}))
}

fn map_status(s: AppStatus) -> pb::AppStatus {
    pb::AppStatus {
        ivi_id: s.id.0,
        name: s.name,
        display_name: s.display_name,
        role: s.role,
        state: s.state.as_str().to_string(),
        run_id: s.run_id.map(|r| r.0).unwrap_or_default(),
        has_run_id: s.run_id.is_some(),
        pid: s.pid.unwrap_or_default(),
        has_pid: s.pid.is_some(),
        binary_path: s.binary_path.unwrap_or_default(),
        launched_at_unix_ms: s.launched_at_unix_ms.unwrap_or_default(),
    }
}

fn map_event(ev: LifecycleEvent) -> pb::LifecycleEvent {
    use pb::lifecycle_event::Kind;

    let kind = match ev {
        LifecycleEvent::Launched { id, run_id } => Kind::Launched(pb::AppLaunched {
            ivi_id: id.0,
            run_id: run_id.0,
        }),
        LifecycleEvent::Terminated { id } => Kind::Terminated(pb::AppTerminated { ivi_id: id.0 }),
        LifecycleEvent::StateChanged { id, old, new } => Kind::StateChanged(pb::StateChanged {
            ivi_id: id.0,
            old_state: old.as_str().to_string(),
            new_state: new.as_str().to_string(),
        }),
        LifecycleEvent::Paused { id } => Kind::Paused(pb::AppPaused { ivi_id: id.0 }),
        LifecycleEvent::Resumed { id } => Kind::Resumed(pb::AppResumed { ivi_id: id.0 }),
    };
    pb::LifecycleEvent { kind: Some(kind) }
}

#[tonic::async_trait]
impl<F: AppLifecycle> AppLifecycleRpc for LifecycleApi<F> {
    async fn launch_app(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.launch_app(id).await)
    }

    async fn activate_app(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.activate_app(id).await)
    }

    async fn terminate_app(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.terminate_app(id).await)
    }

    async fn pause_app(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.pause_app(id).await)
    }

    async fn resume_app(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.resume_app(id).await)
    }

    async fn launch_initial_apps(
        &self,
        _request: Request<pb::LaunchInitialAppsRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        ack(self.facade.launch_initial_apps().await)
    }

    async fn app_connected(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.app_connected(id).await)
    }

    async fn app_disconnected(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        ack(self.facade.app_disconnected(id).await)
    }

    async fn get_app_state(
        &self,
        request: Request<pb::AppRequest>,
    ) -> Result<Response<pb::GetAppStateResponse>, Status> {
        let id = AppId(request.into_inner().ivi_id);
        let state = self.facade.get_app_state(id).await.map_err(unavailable)?;
        Ok(Response::new(pb::GetAppStateResponse { state }))
    }

    async fn get_running_apps(
        &self,
        _request: Request<pb::GetRunningAppsRequest>,
    ) -> Result<Response<pb::GetRunningAppsResponse>, Status> {
        let ids = self.facade.get_running_apps().await.map_err(unavailable)?;
        Ok(Response::new(pb::GetRunningAppsResponse {
            ivi_ids: ids.into_iter().map(|id| id.0).collect(),
        }))
    }

    async fn list_apps(
        &self,
        _request: Request<pb::ListAppsRequest>,
    ) -> Result<Response<pb::ListAppsResponse>, Status> {
        let apps = self.facade.list_apps().await.map_err(unavailable)?;
        Ok(Response::new(pb::ListAppsResponse {
            apps: apps.into_iter().map(map_status).collect(),
        }))
    }

    type WatchEventsStream = EventStream;

    async fn watch_events(
        &self,
        request: Request<pb::WatchEventsRequest>,
    ) -> Result<Response<Self::WatchEventsStream>, Status> {
        let wanted: BTreeSet<u32> = request.into_inner().ivi_ids.into_iter().collect();
        let events = BroadcastStream::new(self.facade.subscribe());
        let stream = events.filter_map(move |item| match item {
            Ok(ev) if wanted.is_empty() || wanted.contains(&ev.app_id().0) => {
                Some(Ok(map_event(ev)))
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event watcher lagged; notifications dropped");
                None
            }
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

pub(crate) fn server<F: AppLifecycle>(facade: F) -> AppLifecycleServer<LifecycleApi<F>> {
    AppLifecycleServer::new(LifecycleApi::new(facade))
}
