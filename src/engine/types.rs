//! Engine API types.
//!
//! Request and response bodies exchanged with the container engine. Field
//! names follow the engine's `PascalCase` JSON; stats payloads use the
//! engine's `snake_case` layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Observed container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    /// Parse the engine's status string. Unknown values map to `Dead`.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            _ => Self::Dead,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A container as observed by a single call. Never cached across commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    /// Engine-assigned ID. Used for every call after resolution.
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    pub state: ContainerState,
    /// Whether the container was created with a TTY.
    pub tty: bool,
}

impl ContainerRef {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Condition for the engine's wait endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    NotRunning,
    NextExit,
    Removed,
}

impl WaitCondition {
    /// Pick the wait condition for an interactive session.
    ///
    /// A created container is already "not running", so waiting on that
    /// condition before start returns immediately with status 0.
    #[must_use]
    pub const fn for_session(start: bool, auto_remove: bool) -> Self {
        if auto_remove {
            Self::Removed
        } else if start {
            Self::NextExit
        } else {
            Self::NotRunning
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotRunning => "not-running",
            Self::NextExit => "next-exit",
            Self::Removed => "removed",
        }
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Which streams to attach to.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Detach sequence in engine notation (e.g. `ctrl-p,ctrl-q`).
    pub detach_keys: Option<String>,
}

/// Container summary from the list endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// First name without the leading `/`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map_or("", |n| n.strip_prefix('/').unwrap_or(n))
    }
}

/// Create container request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub host_config: HostConfig,
}

/// Host configuration for a new container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    pub auto_remove: bool,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_retry_count: Option<i64>,
}

/// Create container response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Container inspect response (subset the core consumes).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: InspectState,
    #[serde(default)]
    pub config: InspectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub image: String,
}

impl From<ContainerInspect> for ContainerRef {
    fn from(inspect: ContainerInspect) -> Self {
        let name = inspect.name.strip_prefix('/').unwrap_or(&inspect.name).to_string();
        Self {
            id: inspect.id,
            name,
            state: ContainerState::parse(&inspect.state.status),
            tty: inspect.config.tty,
        }
    }
}

/// Wait endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,
    #[serde(default)]
    pub error: Option<WaitError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitError {
    #[serde(default)]
    pub message: String,
}

/// Exec instance configuration.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub privileged: bool,
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detach_keys: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

/// Exec inspect response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(rename = "ID", alias = "Id", default)]
    pub id: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// One statistics sample as reported by the engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatsSample {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkStats>>,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
    #[serde(default)]
    pub pids_stats: PidsStats,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlkioStats {
    #[serde(default)]
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PidsStats {
    #[serde(default)]
    pub current: Option<u64>,
}

/// Process listing from the top endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopResponse {
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub processes: Vec<Vec<String>>,
}

/// Options for the logs endpoint.
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub follow: bool,
    pub timestamps: bool,
    pub details: bool,
    pub tail: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

/// Stat of a path inside a container (`X-Docker-Container-Path-Stat`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathStat {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    /// Go `os.FileMode` bits: permissions plus type flags in the high bits.
    #[serde(default)]
    pub mode: u32,
    #[serde(default, rename = "linkTarget")]
    pub link_target: String,
}

impl PathStat {
    const MODE_DIR: u32 = 1 << 31;
    const MODE_SYMLINK: u32 = 1 << 27;

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & Self::MODE_DIR != 0
    }

    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.mode & Self::MODE_SYMLINK != 0
    }
}

/// Options for uploading an archive into a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyToOptions {
    pub allow_overwrite_dir_with_file: bool,
    pub copy_uid_gid: bool,
}

/// Image summary from the image list endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

/// One line of the image removal report.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDeleteItem {
    #[serde(default)]
    pub untagged: Option<String>,
    #[serde(default)]
    pub deleted: Option<String>,
}

/// Truncate an engine ID to its 12-character short form.
#[must_use]
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_condition_for_session() {
        assert_eq!(WaitCondition::for_session(true, false), WaitCondition::NextExit);
        assert_eq!(WaitCondition::for_session(true, true), WaitCondition::Removed);
        assert_eq!(WaitCondition::for_session(false, true), WaitCondition::Removed);
        assert_eq!(WaitCondition::for_session(false, false), WaitCondition::NotRunning);
        assert_eq!(WaitCondition::NextExit.as_str(), "next-exit");
    }

    #[test]
    fn test_inspect_into_ref() {
        let json = r#"{
            "Id": "4f1e2d3c4b5a69788796a5b4c3d2e1f0",
            "Name": "/agentbox.myapp.dev",
            "State": {"Status": "running", "Running": true, "ExitCode": 0},
            "Config": {"Tty": true, "OpenStdin": true, "Image": "alpine"}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        let r = ContainerRef::from(inspect);
        assert_eq!(r.name, "agentbox.myapp.dev");
        assert_eq!(r.state, ContainerState::Running);
        assert!(r.tty);
        assert!(r.is_running());
    }

    #[test]
    fn test_path_stat_mode_bits() {
        let dir = PathStat { name: "etc".into(), mode: (1 << 31) | 0o755, ..PathStat::default() };
        assert!(dir.is_dir());
        assert!(!dir.is_symlink());

        let link = PathStat { name: "sh".into(), mode: (1 << 27) | 0o777, ..PathStat::default() };
        assert!(link.is_symlink());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_stats_sample_decodes_engine_payload() {
        let json = r#"{
            "id": "abc", "name": "/web",
            "cpu_stats": {"cpu_usage": {"total_usage": 200}, "system_cpu_usage": 2000, "online_cpus": 2},
            "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000},
            "memory_stats": {"usage": 1048576, "limit": 4194304},
            "networks": {"eth0": {"rx_bytes": 10, "tx_bytes": 20}},
            "blkio_stats": {"io_service_bytes_recursive": [{"op": "Read", "value": 5}]},
            "pids_stats": {"current": 3}
        }"#;
        let s: StatsSample = serde_json::from_str(json).unwrap();
        assert_eq!(s.cpu_stats.online_cpus, Some(2));
        assert_eq!(s.memory_stats.limit, Some(4_194_304));
        assert_eq!(s.pids_stats.current, Some(3));
    }
}
