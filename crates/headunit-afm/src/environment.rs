use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use headunit_lifecycle::AppId;

/// Used when the supervisor itself was started without `XDG_RUNTIME_DIR`.
const FALLBACK_RUNTIME_DIR: &str = "/run/user/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DisplayMode {
    /// Client of the running compositor.
    Wayland,
    /// Direct rendering on the KMS device; one fullscreen app at a time.
    Eglfs,
}

#[derive(Debug, Clone)]
pub(crate) struct LaunchEnvironment {
    pub(crate) mode: DisplayMode,
    /// Variables layered on top of the supervisor's own environment.
    pub(crate) vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct EnvironmentBuilder {
    socket_name: String,
    /// Replaces the inherited `XDG_RUNTIME_DIR` for detection and children.
    runtime_dir: Option<String>,
}

impl EnvironmentBuilder {
    pub(crate) fn new(socket_name: impl Into<String>) -> Self {
        Self {
            socket_name: socket_name.into(),
            runtime_dir: None,
        }
    }

    pub(crate) fn with_runtime_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.runtime_dir = dir.map(|d| d.display().to_string());
        self
    }

    fn runtime_dir(&self) -> Option<String> {
        self.runtime_dir.clone().or_else(|| {
            std::env::var("XDG_RUNTIME_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
    }

    fn socket_path(&self, runtime_dir: &str) -> PathBuf {
        Path::new(runtime_dir).join(&self.socket_name)
    }

    /// Path of the compositor socket if it exists right now.
    pub(crate) fn compositor_socket(&self) -> Option<PathBuf> {
        let runtime_dir = self
            .runtime_dir()
            .unwrap_or_else(|| FALLBACK_RUNTIME_DIR.to_string());
        let path = self.socket_path(&runtime_dir);
        path.exists().then_some(path)
    }

    /// Evaluated on every launch: compositor availability changes between launches.
    pub(crate) fn build(&self, id: AppId) -> LaunchEnvironment {
        let mut env = self.build_with(id, self.runtime_dir());
        if let Some(dir) = &self.runtime_dir {
            env.vars.insert("XDG_RUNTIME_DIR".to_string(), dir.clone());
        }
        env
    }

    pub(crate) fn build_with(&self, id: AppId, runtime_dir: Option<String>) -> LaunchEnvironment {
        let mut vars = BTreeMap::new();

        let runtime_dir = match runtime_dir {
            Some(dir) => dir,
            None => {
                tracing::warn!(
                    app_id = %id,
                    fallback = FALLBACK_RUNTIME_DIR,
                    "XDG_RUNTIME_DIR not set; using fallback"
                );
                vars.insert(
                    "XDG_RUNTIME_DIR".to_string(),
                    FALLBACK_RUNTIME_DIR.to_string(),
                );
                FALLBACK_RUNTIME_DIR.to_string()
            }
        };

        let socket = self.socket_path(&runtime_dir);
        let mode = if socket.exists() {
            tracing::info!(
                app_id = %id,
                socket = %socket.display(),
                "compositor detected; wayland mode"
            );
            vars.insert("QT_QPA_PLATFORM".to_string(), "wayland".to_string());
            vars.insert(
                "QT_WAYLAND_SHELL_INTEGRATION".to_string(),
                "ivi-shell".to_string(),
            );
            vars.insert("QT_IVI_SURFACE_ID".to_string(), id.0.to_string());
            vars.insert("WAYLAND_DISPLAY".to_string(), self.socket_name.clone());
            vars.insert(
                "QT_LOGGING_RULES".to_string(),
                "qt.qpa.wayland*=false".to_string(),
            );
            DisplayMode::Wayland
        } else {
            tracing::warn!(
                app_id = %id,
                socket = %socket.display(),
                "no compositor socket; standalone eglfs mode (one app visible at a time)"
            );
            vars.insert("QT_QPA_PLATFORM".to_string(), "eglfs".to_string());
            vars.insert(
                "QT_QPA_EGLFS_INTEGRATION".to_string(),
                "eglfs_kms".to_string(),
            );
            vars.insert("QT_QPA_EGLFS_ALWAYS_SET_MODE".to_string(), "1".to_string());
            DisplayMode::Eglfs
        };

        vars.insert("LC_ALL".to_string(), "C.UTF-8".to_string());

        LaunchEnvironment { mode, vars }
    }
}
