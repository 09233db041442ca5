use std::{fmt, str::FromStr};

pub mod machine;

/// Stable application identifier.
///
/// NOTE: This doubles as the compositor surface id. A launched client gets it
/// in its environment and the compositor uses it to map the surface back.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct AppId(pub u32);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes successive process instances of the same application.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Stopped,
    Launching,
    Running,
    Active,
    Paused,
    Error,
    Crashed,
}

impl AppState {
    pub const ALL: [AppState; 7] = [
        AppState::Stopped,
        AppState::Launching,
        AppState::Running,
        AppState::Active,
        AppState::Paused,
        AppState::Error,
        AppState::Crashed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Stopped => "stopped",
            AppState::Launching => "launching",
            AppState::Running => "running",
            AppState::Active => "active",
            AppState::Paused => "paused",
            AppState::Error => "error",
            AppState::Crashed => "crashed",
        }
    }

    /// States in which a child process is expected to exist.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AppState::Launching | AppState::Running | AppState::Active | AppState::Paused
        )
    }

    /// States from which a fresh launch may start.
    pub fn is_launchable(self) -> bool {
        matches!(
            self,
            AppState::Stopped | AppState::Error | AppState::Crashed
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown app state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for AppState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        AppState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or(UnknownState(s))
    }
}

/// Where `resume` lands a paused application.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResumeTarget {
    #[default]
    Active,
    Running,
}

impl ResumeTarget {
    pub fn state(self) -> AppState {
        match self {
            ResumeTarget::Active => AppState::Active,
            ResumeTarget::Running => AppState::Running,
        }
    }
}

impl FromStr for ResumeTarget {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ResumeTarget::Active),
            "running" => Ok(ResumeTarget::Running),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppStatus {
    pub id: AppId,
    pub name: String,
    pub display_name: String,
    pub role: String,
    pub state: AppState,
    pub run_id: Option<RunId>,
    pub pid: Option<u32>,
    pub binary_path: Option<String>,
    pub launched_at_unix_ms: Option<u64>,
}

/// Notifications emitted to subscribers, one per accepted transition plus the
/// launch/terminate/pause/resume markers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        id: AppId,
        old: AppState,
        new: AppState,
    },
    Launched {
        id: AppId,
        run_id: RunId,
    },
    Terminated {
        id: AppId,
    },
    Paused {
        id: AppId,
    },
    Resumed {
        id: AppId,
    },
}

impl LifecycleEvent {
    pub fn app_id(&self) -> AppId {
        match self {
            LifecycleEvent::StateChanged { id, .. }
            | LifecycleEvent::Launched { id, .. }
            | LifecycleEvent::Terminated { id }
            | LifecycleEvent::Paused { id }
            | LifecycleEvent::Resumed { id } => *id,
        }
    }
}
