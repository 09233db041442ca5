use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use headunit_lifecycle::{AppId, AppState, AppStatus, RunId};

use crate::supervisor::ProcessHandle;

/// Fallback naming convention for installed binaries (`headunit-GearSelector`).
pub(crate) const BINARY_PREFIX: &str = "headunit-";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("read registry file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse registry file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("registry file {} declares no applications", .path.display())]
    Empty { path: PathBuf },
}

/// One `[[app]]` entry of the registry seed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub(crate) struct SeedEntry {
    pub(crate) id: u32,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) display_name: Option<String>,
    #[serde(default)]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) autostart: bool,
    #[serde(default)]
    pub(crate) binary: Option<PathBuf>,
}

impl SeedEntry {
    fn new(id: u32, name: &str, display_name: &str, autostart: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            display_name: Some(display_name.to_string()),
            role: Some(name.to_string()),
            autostart,
            binary: None,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SeedFile {
    #[serde(default, rename = "app")]
    apps: Vec<SeedEntry>,
}

pub(crate) fn builtin_seed() -> Vec<SeedEntry> {
    vec![
        SeedEntry::new(1001, "GearSelector", "Gear Selector", true),
        SeedEntry::new(1002, "MediaPlayer", "Media Player", true),
        SeedEntry::new(1003, "ThemeColor", "Theme & Colors", true),
        SeedEntry::new(1004, "Navigation", "Navigation", false),
        SeedEntry::new(1005, "Settings", "Settings", false),
    ]
}

pub(crate) fn parse_seed(path: &Path, text: &str) -> Result<Vec<SeedEntry>, ConfigError> {
    let file: SeedFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if file.apps.is_empty() {
        return Err(ConfigError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(file.apps)
}

pub(crate) fn load_seed(path: &Path) -> Result<Vec<SeedEntry>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_seed(path, &text)
}

#[derive(Debug)]
pub(crate) struct AppRecord {
    pub(crate) id: AppId,
    pub(crate) name: String,
    pub(crate) display_name: String,
    pub(crate) role: String,
    pub(crate) autostart: bool,
    pub(crate) binary_path: Option<PathBuf>,
    pub(crate) state: AppState,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) run_id: Option<RunId>,
    pub(crate) pid: Option<u32>,
    pub(crate) launched_at: Option<SystemTime>,
    pub(crate) restart_attempts: u32,
    /// Token of the restart currently scheduled, if any.
    pub(crate) pending_restart: Option<u64>,
    /// Terminate arrived while launching; stop once the process reports started.
    pub(crate) stop_on_start: bool,
}

impl AppRecord {
    pub(crate) fn from_seed(seed: SeedEntry) -> Self {
        let display_name = seed.display_name.unwrap_or_else(|| seed.name.clone());
        let role = seed.role.unwrap_or_else(|| seed.name.clone());
        Self {
            id: AppId(seed.id),
            name: seed.name,
            display_name,
            role,
            autostart: seed.autostart,
            binary_path: seed.binary,
            state: AppState::Stopped,
            process: None,
            run_id: None,
            pid: None,
            launched_at: None,
            restart_attempts: 0,
            pending_restart: None,
            stop_on_start: false,
        }
    }

    pub(crate) fn status(&self) -> AppStatus {
        AppStatus {
            id: self.id,
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            role: self.role.clone(),
            state: self.state,
            run_id: self.run_id,
            pid: self.pid,
            binary_path: self.binary_path.as_ref().map(|p| p.display().to_string()),
            launched_at_unix_ms: self.launched_at.map(unix_ms),
        }
    }
}

pub(crate) fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Fixed catalog of launchable applications, ordered by id.
///
/// Records are inserted once at startup and never removed; everything after
/// that is an in-place field update.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    apps: BTreeMap<AppId, AppRecord>,
}

impl Registry {
    pub(crate) fn from_seed(seed: Vec<SeedEntry>) -> Self {
        let mut registry = Self::default();
        for entry in seed {
            registry.register(entry);
        }
        registry
    }

    /// Returns false (and logs) when the id is already taken; the first
    /// registration wins.
    pub(crate) fn register(&mut self, seed: SeedEntry) -> bool {
        let id = AppId(seed.id);
        if let Some(existing) = self.apps.get(&id) {
            tracing::error!(
                app_id = %id,
                existing = %existing.name,
                rejected = %seed.name,
                "duplicate application id in registry; ignoring later entry"
            );
            return false;
        }
        self.apps.insert(id, AppRecord::from_seed(seed));
        true
    }

    pub(crate) fn get(&self, id: AppId) -> Option<&AppRecord> {
        self.apps.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: AppId) -> Option<&mut AppRecord> {
        self.apps.get_mut(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &AppRecord> {
        self.apps.values()
    }

    pub(crate) fn ids(&self) -> Vec<AppId> {
        self.apps.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.apps.len()
    }
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Canonical path of `path` if it names an executable regular file.
pub(crate) fn executable_canonical(path: &Path) -> Option<PathBuf> {
    if !is_executable_file(path) {
        return None;
    }
    std::fs::canonicalize(path).ok()
}

/// Searches `search_paths` in order for `name`, then for the prefixed
/// fallback name. Returns the first canonical match.
pub(crate) fn resolve_binary(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') {
        return None;
    }

    let prefixed = format!("{BINARY_PREFIX}{name}");
    for candidate in [name, prefixed.as_str()] {
        for dir in search_paths {
            let full = dir.join(candidate);
            tracing::debug!(path = %full.display(), "checking binary candidate");
            if let Some(found) = executable_canonical(&full) {
                tracing::info!(app = name, path = %found.display(), "binary resolved");
                return Some(found);
            }
        }
    }

    tracing::warn!(app = name, "binary not found in any search path");
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[cfg(unix)]
    pub(crate) fn write_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perm = std::fs::metadata(&path).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).unwrap();
        path
    }

    #[test]
    fn builtin_seed_has_unique_ids_and_autostarts_first_three() {
        let reg = Registry::from_seed(builtin_seed());
        assert_eq!(reg.len(), 5);
        let autostart: Vec<u32> = reg.iter().filter(|r| r.autostart).map(|r| r.id.0).collect();
        assert_eq!(autostart, vec![1001, 1002, 1003]);
        let gear = reg.get(AppId(1001)).unwrap();
        assert_eq!(gear.display_name, "Gear Selector");
        assert_eq!(gear.state, AppState::Stopped);
        assert!(gear.process.is_none());
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut reg = Registry::default();
        assert!(reg.register(SeedEntry::new(7, "First", "First", false)));
        assert!(!reg.register(SeedEntry::new(7, "Second", "Second", true)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(AppId(7)).unwrap().name, "First");
    }

    #[test]
    fn seed_file_fills_defaults() {
        let text = r#"
[[app]]
id = 2001
name = "Cluster"

[[app]]
id = 2002
name = "Radio"
display_name = "FM Radio"
role = "media"
autostart = true
binary = "/opt/hu/radio"
"#;
        let seed = parse_seed(Path::new("apps.toml"), text).unwrap();
        let reg = Registry::from_seed(seed);
        let cluster = reg.get(AppId(2001)).unwrap();
        assert_eq!(cluster.display_name, "Cluster");
        assert_eq!(cluster.role, "Cluster");
        assert!(!cluster.autostart);
        let radio = reg.get(AppId(2002)).unwrap();
        assert_eq!(radio.role, "media");
        assert_eq!(radio.binary_path, Some(PathBuf::from("/opt/hu/radio")));
    }

    #[test]
    fn empty_or_malformed_seed_is_rejected() {
        assert!(matches!(
            parse_seed(Path::new("a.toml"), ""),
            Err(ConfigError::Empty { .. })
        ));
        assert!(matches!(
            parse_seed(Path::new("a.toml"), "[[app]]\nid = \"x\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_prefers_earlier_dirs_and_plain_names() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_executable(second.path(), "GearSelector", "#!/bin/sh\n");
        write_executable(first.path(), "headunit-GearSelector", "#!/bin/sh\n");
        let paths = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        let found = resolve_binary("GearSelector", &paths).unwrap();
        assert_eq!(
            found,
            std::fs::canonicalize(second.path().join("GearSelector")).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolve_falls_back_to_prefixed_name() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "headunit-Settings", "#!/bin/sh\n");
        let found = resolve_binary("Settings", &[dir.path().to_path_buf()]).unwrap();
        assert!(found.ends_with("headunit-Settings"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_skips_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MediaPlayer"), "data").unwrap();
        let paths = [dir.path().to_path_buf()];
        assert!(resolve_binary("MediaPlayer", &paths).is_none());
        assert!(resolve_binary("../MediaPlayer", &paths).is_none());
    }
}
