use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use headunit_lifecycle::ResumeTarget;

use crate::restart::{RestartConfig, parse_restart_config};

const ENV_PREFIX: &str = "HEADUNIT_AFM_";

const DEFAULT_LISTEN: &str = "127.0.0.1:50061";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_RUN_DIR: &str = "./run";
const DEFAULT_WAYLAND_SOCKET: &str = "wayland-1";
const DEFAULT_SEARCH_PATHS: &[&str] = &["./applications", "/usr/local/bin", "/usr/bin"];

/// Source of configuration values. `std::env::var` in production; tests pass
/// a map so they never touch the process environment.
pub(crate) trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

pub(crate) struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl Lookup for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

fn var(env: &dyn Lookup, name: &str) -> Option<String> {
    env.get(&format!("{ENV_PREFIX}{name}"))
}

pub(crate) fn env_usize(env: &dyn Lookup, name: &str) -> Option<usize> {
    var(env, name).and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(env: &dyn Lookup, name: &str) -> Option<u64> {
    var(env, name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn is_enabled(raw: &str) -> bool {
    let raw = raw.trim().to_ascii_lowercase();
    !matches!(raw.as_str(), "0" | "false" | "off" | "no")
}

fn env_millis(env: &dyn Lookup, name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(
        env_u64(env, name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default),
    )
}

#[derive(Clone, Debug)]
pub(crate) struct AutostartConfig {
    pub(crate) enabled: bool,
    pub(crate) delay: Duration,
    pub(crate) retry: Duration,
    pub(crate) max_attempts: u32,
    pub(crate) stagger: Duration,
}

#[derive(Clone, Debug)]
pub(crate) struct AfmConfig {
    pub(crate) listen: SocketAddr,
    pub(crate) log_dir: PathBuf,
    pub(crate) run_dir: PathBuf,
    pub(crate) apps_file: Option<PathBuf>,
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) wayland_socket: String,
    /// Overrides `XDG_RUNTIME_DIR` when looking for the compositor socket.
    pub(crate) runtime_dir: Option<PathBuf>,
    pub(crate) watchdog_interval: Duration,
    pub(crate) stop_grace: Duration,
    pub(crate) autostart: AutostartConfig,
    pub(crate) resume_target: ResumeTarget,
    pub(crate) restart: RestartConfig,
}

#[cfg(test)]
impl Default for AfmConfig {
    fn default() -> Self {
        Self::from_lookup(&BTreeMap::new()).unwrap()
    }
}

impl AfmConfig {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&ProcessEnv)
    }

    pub(crate) fn from_lookup(env: &dyn Lookup) -> anyhow::Result<Self> {
        let listen_raw = var(env, "LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen_raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}LISTEN: {listen_raw}"))?;

        let search_paths = match var(env, "SEARCH_PATHS") {
            Some(raw) => raw
                .split(':')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
        };

        let resume_target = match var(env, "RESUME_TARGET") {
            Some(raw) => raw
                .parse::<ResumeTarget>()
                .with_context(|| format!("invalid {ENV_PREFIX}RESUME_TARGET: {raw}"))?,
            None => ResumeTarget::default(),
        };

        let autostart = AutostartConfig {
            enabled: var(env, "AUTOSTART").is_none_or(|v| is_enabled(&v)),
            delay: env_millis(env, "AUTOSTART_DELAY_MS", 5000, 0, 10 * 60 * 1000),
            retry: env_millis(env, "AUTOSTART_RETRY_MS", 2000, 100, 60_000),
            max_attempts: env_usize(env, "AUTOSTART_MAX_ATTEMPTS")
                .map(|v| v.clamp(0, 1000) as u32)
                .unwrap_or(15),
            stagger: env_millis(env, "AUTOSTART_STAGGER_MS", 1000, 0, 60_000),
        };

        Ok(Self {
            listen,
            log_dir: var(env, "LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            run_dir: var(env, "RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_DIR)),
            apps_file: var(env, "APPS_FILE").map(PathBuf::from),
            search_paths,
            wayland_socket: var(env, "WAYLAND_SOCKET")
                .unwrap_or_else(|| DEFAULT_WAYLAND_SOCKET.to_string()),
            runtime_dir: var(env, "RUNTIME_DIR").map(PathBuf::from),
            watchdog_interval: env_millis(env, "WATCHDOG_MS", 5000, 500, 60_000),
            stop_grace: env_millis(env, "STOP_GRACE_MS", 3000, 100, 60_000),
            autostart,
            resume_target,
            restart: parse_restart_config(&restart_params(env)),
        })
    }
}

/// Maps `HEADUNIT_AFM_RESTART_*` onto the restart parameter keys.
fn restart_params(env: &dyn Lookup) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (var_name, key) in [
        ("RESTART_POLICY", "restart_policy"),
        ("RESTART_MAX_RETRIES", "restart_max_retries"),
        ("RESTART_BACKOFF_MS", "restart_backoff_ms"),
        ("RESTART_BACKOFF_MAX_MS", "restart_backoff_max_ms"),
        ("STABLE_RUN_MS", "stable_run_ms"),
    ] {
        if let Some(v) = var(env, var_name) {
            params.insert(key.to_string(), v);
        }
    }
    params
}
