//! User settings and project configuration.
//!
//! Settings live at `$XDG_CONFIG_HOME/agentbox/settings.toml` (or
//! `~/.config/agentbox/settings.toml`). A project is described by an
//! `agentbox.toml` found in the working directory or one of its parents.
//! Values resolve as: CLI flag > env var > config file > default.

use crate::engine::default_socket_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use crate::session::detach::DEFAULT_DETACH_KEYS;

/// Project config file name.
pub const PROJECT_FILE: &str = "agentbox.toml";

/// Default in-container workspace mount point.
pub const DEFAULT_WORKSPACE_TARGET: &str = "/workspace";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid engine host {0:?}: only unix:// sockets are supported")]
    UnsupportedHost(String),
}

// -----------------------------------------------------------------------
// File types
// -----------------------------------------------------------------------

/// User-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_image: Option<String>,
    pub engine_socket: Option<PathBuf>,
    pub detach_keys: Option<String>,
}

/// How the project directory is shared with containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    #[default]
    Bind,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub mode: WorkspaceMode,
    pub target: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            mode: WorkspaceMode::Bind,
            target: DEFAULT_WORKSPACE_TARGET.to_string(),
        }
    }
}

/// Contents of `agentbox.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project: Option<String>,
    pub default_image: Option<String>,
    pub workspace: WorkspaceConfig,
}

/// A resolved project.
#[derive(Debug, Clone)]
pub struct Project {
    /// Canonical project key used in container names and labels.
    pub key: String,
    /// Directory containing `agentbox.toml`, or the working directory.
    pub root: PathBuf,
    pub config: ProjectConfig,
}

impl Project {
    /// Bind mount for the workspace, if enabled.
    #[must_use]
    pub fn workspace_bind(&self) -> Option<String> {
        match self.config.workspace.mode {
            WorkspaceMode::Bind => Some(format!(
                "{}:{}",
                self.root.display(),
                self.config.workspace.target
            )),
            WorkspaceMode::None => None,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The agentbox config directory, always in XDG layout.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("agentbox");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agentbox")
}

#[must_use]
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.toml")
}

// -----------------------------------------------------------------------
// Loading
// -----------------------------------------------------------------------

fn read_toml<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(T::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load user settings. A missing file yields defaults.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    read_toml(path)
}

/// Find `agentbox.toml` in `start` or its ancestors.
#[must_use]
pub fn find_project_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_FILE))
        .find(|candidate| candidate.is_file())
}

/// Resolve the project for a working directory.
pub fn load_project(workdir: &Path) -> Result<Project, ConfigError> {
    let (root, config) = match find_project_file(workdir) {
        Some(file) => {
            let config: ProjectConfig = read_toml(&file)?;
            let root = file.parent().unwrap_or(workdir).to_path_buf();
            (root, config)
        }
        None => (workdir.to_path_buf(), ProjectConfig::default()),
    };

    let key = config.project.as_deref().map_or_else(
        || {
            root.file_name()
                .map_or_else(|| "default".to_string(), |n| project_key(&n.to_string_lossy()))
        },
        project_key,
    );

    debug!(project = %key, root = %root.display(), "resolved project");
    Ok(Project { key, root, config })
}

/// Normalize a project name into a key usable in container names.
///
/// Lowercases and replaces anything outside `[a-z0-9_-]` with `-`. Dots are
/// replaced because they separate the parts of a container name.
#[must_use]
pub fn project_key(name: &str) -> String {
    let key: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let key = key.trim_matches('-');
    if key.is_empty() {
        "default".to_string()
    } else {
        key.to_string()
    }
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Parse an engine host value. Accepts `unix:///path` or a bare path.
pub fn parse_host(host: &str) -> Result<PathBuf, ConfigError> {
    if let Some(path) = host.strip_prefix("unix://") {
        return Ok(PathBuf::from(path));
    }
    if host.contains("://") {
        return Err(ConfigError::UnsupportedHost(host.to_string()));
    }
    Ok(PathBuf::from(host))
}

/// Engine socket: `--host` > `AGENTBOX_HOST` / `DOCKER_HOST` > settings > default.
pub fn resolve_socket(cli_host: Option<&str>, settings: &Settings) -> Result<PathBuf, ConfigError> {
    if let Some(host) = cli_host {
        return parse_host(host);
    }
    for var in ["AGENTBOX_HOST", "DOCKER_HOST"] {
        if let Ok(host) = std::env::var(var) {
            if !host.is_empty() {
                return parse_host(&host);
            }
        }
    }
    if let Some(path) = &settings.engine_socket {
        return Ok(path.clone());
    }
    Ok(default_socket_path())
}

/// Detach keys: flag > settings > default.
#[must_use]
pub fn resolve_detach_keys(cli: Option<&str>, settings: &Settings) -> String {
    cli.map(str::to_string)
        .or_else(|| settings.detach_keys.clone())
        .unwrap_or_else(|| DEFAULT_DETACH_KEYS.to_string())
}

/// Fully resolved configuration for a command invocation.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: Settings,
    pub project: Project,
    pub socket: PathBuf,
}

impl ResolvedConfig {
    pub fn resolve(workdir: &Path, cli_host: Option<&str>) -> Result<Self, ConfigError> {
        let settings = load_settings()?;
        let project = load_project(workdir)?;
        let socket = resolve_socket(cli_host, &settings)?;
        Ok(Self {
            settings,
            project,
            socket,
        })
    }
}
