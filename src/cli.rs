//! Command-line interface for agentbox.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Parse a memory size such as `512m`, `2g` or `1048576` into bytes.
///
/// Suffixes are 1024-based and case-insensitive: `b`, `k`, `m`, `g`, `t`.
pub fn parse_memory(s: &str) -> Result<i64, String> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').filter(|r| !r.is_empty()).unwrap_or(&s);
    let (digits, shift) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 10),
        Some('m') => (&s[..s.len() - 1], 20),
        Some('g') => (&s[..s.len() - 1], 30),
        Some('t') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}: expected a number with an optional b/k/m/g/t suffix"))?;
    value
        .checked_mul(1 << shift)
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("invalid size {s:?}"))
}

/// Project-aware container CLI.
#[derive(Debug, Parser)]
#[command(name = "agentbox", version, about)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Project directory (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Engine socket, e.g. unix:///var/run/docker.sock.
    #[arg(long, global = true, value_name = "SOCKET", env = "AGENTBOX_HOST")]
    pub host: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage containers.
    #[command(subcommand)]
    Container(ContainerCommand),

    #[command(flatten)]
    Direct(ContainerCommand),

    /// Remove one or more images.
    Rmi(RmiArgs),
}

impl Command {
    /// The container command, whether given at top level or under `container`.
    #[must_use]
    pub const fn container(&self) -> Option<&ContainerCommand> {
        match self {
            Self::Container(c) | Self::Direct(c) => Some(c),
            Self::Rmi(_) => None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ContainerCommand {
    /// Create and run a new container.
    Run(RunArgs),

    /// Create a new container without starting it.
    Create(CreateArgs),

    /// Start one or more stopped containers.
    Start(StartArgs),

    /// Stop one or more running containers.
    Stop(StopArgs),

    /// Restart one or more containers.
    Restart(StopArgs),

    /// Kill one or more running containers.
    Kill(KillArgs),

    /// Pause all processes within one or more containers.
    Pause(TargetsArgs),

    /// Unpause all processes within one or more containers.
    Unpause(TargetsArgs),

    /// Rename a container.
    Rename(RenameArgs),

    /// Remove one or more containers.
    Rm(RmArgs),

    /// Block until one or more containers stop, then print their exit codes.
    Wait(TargetsArgs),

    /// Execute a command in a running container.
    Exec(ExecArgs),

    /// Attach local stdin, stdout and stderr to a running container.
    Attach(AttachArgs),

    /// Copy files between a container and the local filesystem.
    Cp(CpArgs),

    /// Fetch the logs of a container.
    Logs(LogsArgs),

    /// List the project's containers.
    #[command(alias = "list")]
    Ps(PsArgs),

    /// Display detailed information on one or more containers.
    Inspect(InspectArgs),

    /// Display a live stream of container resource usage.
    Stats(StatsArgs),

    /// Display the running processes of a container.
    Top(TopArgs),
}

/// Container configuration shared by `run` and `create`.
#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    /// Container name (defaults to agentbox.<project>.<agent>).
    #[arg(long)]
    pub name: Option<String>,

    /// Agent name (defaults to a generated name).
    #[arg(long)]
    pub agent: Option<String>,

    /// Keep stdin open.
    #[arg(short, long)]
    pub interactive: bool,

    /// Allocate a pseudo-TTY.
    #[arg(short, long)]
    pub tty: bool,

    /// Remove the container when it exits.
    #[arg(long)]
    pub rm: bool,

    /// Environment variables (KEY=VALUE, can be repeated).
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Username or UID.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Give extended privileges to the container.
    #[arg(long)]
    pub privileged: bool,

    /// Override the image entrypoint.
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Labels (KEY=VALUE, can be repeated).
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub label: Vec<String>,

    /// Bind mounts (SRC:DST[:OPTS], can be repeated).
    #[arg(short, long, value_name = "SRC:DST")]
    pub volume: Vec<String>,

    /// Memory limit (e.g. 512m, 2g).
    #[arg(short, long, value_parser = parse_memory)]
    pub memory: Option<i64>,

    /// Memory plus swap limit; requires --memory.
    #[arg(long, value_parser = parse_memory)]
    pub memory_swap: Option<i64>,

    /// Restart policy: no, always, unless-stopped, on-failure[:N].
    #[arg(long)]
    pub restart: Option<String>,

    /// Image to run, or @ for the project image.
    pub image: String,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Run in the background and print the container ID.
    #[arg(short, long)]
    pub detach: bool,

    /// Override the detach key sequence.
    #[arg(long)]
    pub detach_keys: Option<String>,

    #[command(flatten)]
    pub create: CreateArgs,
}

/// Containers given by name, ID or (with --agent) agent name.
#[derive(Debug, Clone, Args)]
pub struct TargetsArgs {
    /// Treat arguments as agent names of the current project.
    #[arg(long)]
    pub agent: bool,

    #[arg(required = true, value_name = "CONTAINER")]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Attach stdout/stderr and forward signals.
    #[arg(short, long)]
    pub attach: bool,

    /// Attach stdin.
    #[arg(short, long)]
    pub interactive: bool,

    /// Override the detach key sequence.
    #[arg(long)]
    pub detach_keys: Option<String>,

    #[command(flatten)]
    pub targets: TargetsArgs,
}

#[derive(Debug, Clone, Args)]
pub struct StopArgs {
    /// Seconds to wait before killing the container.
    #[arg(short, long)]
    pub time: Option<i64>,

    #[command(flatten)]
    pub targets: TargetsArgs,
}

#[derive(Debug, Clone, Args)]
pub struct KillArgs {
    /// Signal to send.
    #[arg(short, long)]
    pub signal: Option<String>,

    #[command(flatten)]
    pub targets: TargetsArgs,
}

#[derive(Debug, Clone, Args)]
pub struct RenameArgs {
    /// Treat both names as agent names of the current project.
    #[arg(long)]
    pub agent: bool,

    pub old: String,

    pub new: String,
}

#[derive(Debug, Clone, Args)]
pub struct RmArgs {
    /// Force removal of running containers.
    #[arg(short, long)]
    pub force: bool,

    /// Remove anonymous volumes.
    #[arg(short, long)]
    pub volumes: bool,

    #[command(flatten)]
    pub targets: TargetsArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Run in the background and print the exec ID.
    #[arg(short, long)]
    pub detach: bool,

    /// Keep stdin open.
    #[arg(short, long)]
    pub interactive: bool,

    /// Allocate a pseudo-TTY.
    #[arg(short, long)]
    pub tty: bool,

    /// Environment variables (KEY=VALUE, can be repeated).
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Username or UID.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Give extended privileges to the command.
    #[arg(long)]
    pub privileged: bool,

    /// Override the detach key sequence.
    #[arg(long)]
    pub detach_keys: Option<String>,

    /// Treat the container argument as an agent name.
    #[arg(long)]
    pub agent: bool,

    pub container: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct AttachArgs {
    /// Do not attach stdin.
    #[arg(long)]
    pub no_stdin: bool,

    /// Override the detach key sequence.
    #[arg(long)]
    pub detach_keys: Option<String>,

    /// Treat the container argument as an agent name.
    #[arg(long)]
    pub agent: bool,

    pub container: String,
}

#[derive(Debug, Clone, Args)]
pub struct CpArgs {
    /// Archive mode: keep UID/GID.
    #[arg(short, long)]
    pub archive: bool,

    /// Keep UID/GID of copied files.
    #[arg(long)]
    pub copy_uidgid: bool,

    /// Follow symlinks in the source path.
    #[arg(short = 'L', long)]
    pub follow_link: bool,

    /// Agent whose container is used for `:PATH` arguments.
    #[arg(long)]
    pub agent: Option<String>,

    /// Source: host path, `-` for stdin, or CONTAINER:PATH.
    pub src: String,

    /// Destination: host path, `-` for stdout, or CONTAINER:PATH.
    pub dst: String,
}

#[derive(Debug, Clone, Args)]
pub struct LogsArgs {
    /// Follow log output.
    #[arg(short, long)]
    pub follow: bool,

    /// Show timestamps.
    #[arg(short, long)]
    pub timestamps: bool,

    /// Number of lines to show from the end.
    #[arg(short = 'n', long)]
    pub tail: Option<String>,

    /// Show logs since a timestamp or relative time (e.g. 10m).
    #[arg(long)]
    pub since: Option<String>,

    /// Show logs before a timestamp or relative time.
    #[arg(long)]
    pub until: Option<String>,

    /// Show extra details.
    #[arg(long)]
    pub details: bool,

    /// Treat the container argument as an agent name.
    #[arg(long)]
    pub agent: bool,

    pub container: String,
}

#[derive(Debug, Clone, Args)]
pub struct PsArgs {
    /// Show all containers, not just running ones.
    #[arg(short, long)]
    pub all: bool,

    /// Only print container IDs.
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not truncate IDs.
    #[arg(long)]
    pub no_trunc: bool,
}

#[derive(Debug, Clone, Args)]
pub struct InspectArgs {
    /// Format output with a template, e.g. '{{.State.Status}}'.
    #[arg(short, long)]
    pub format: Option<String>,

    #[command(flatten)]
    pub targets: TargetsArgs,
}

#[derive(Debug, Clone, Args)]
pub struct StatsArgs {
    /// Print one table and exit.
    #[arg(long)]
    pub no_stream: bool,

    /// Do not truncate IDs.
    #[arg(long)]
    pub no_trunc: bool,

    /// Treat arguments as agent names of the current project.
    #[arg(long)]
    pub agent: bool,

    /// Containers (defaults to the project's running containers).
    #[arg(value_name = "CONTAINER")]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct TopArgs {
    /// Treat the container argument as an agent name.
    #[arg(long)]
    pub agent: bool,

    pub container: String,

    /// Options passed to ps.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub ps_args: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RmiArgs {
    /// Force removal.
    #[arg(short, long)]
    pub force: bool,

    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1024"), Ok(1024));
        assert_eq!(parse_memory("512m"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_memory("2G"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("64kb"), Ok(64 * 1024));
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn test_container_commands_at_top_level_and_grouped() {
        let top = Cli::try_parse_from(["agentbox", "stop", "web"]).unwrap();
        let grouped = Cli::try_parse_from(["agentbox", "container", "stop", "web"]).unwrap();
        assert!(matches!(top.command.container(), Some(ContainerCommand::Stop(_))));
        assert!(matches!(grouped.command.container(), Some(ContainerCommand::Stop(_))));
    }

    #[test]
    fn test_run_keeps_command_flags() {
        let cli = Cli::try_parse_from(["agentbox", "run", "-it", "--rm", "alpine", "ls", "-la"]).unwrap();
        let Some(ContainerCommand::Run(args)) = cli.command.container() else {
            panic!("expected run");
        };
        assert!(args.create.interactive && args.create.tty && args.create.rm);
        assert_eq!(args.create.image, "alpine");
        assert_eq!(args.create.cmd, vec!["ls", "-la"]);
    }

    #[test]
    fn test_list_alias() {
        let cli = Cli::try_parse_from(["agentbox", "list", "-a"]).unwrap();
        assert!(matches!(cli.command.container(), Some(ContainerCommand::Ps(p)) if p.all));
    }

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = Cli::try_parse_from([
            "agentbox", "--debug", "--workdir", "/tmp/proj", "--host", "unix:///tmp/d.sock", "ps",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.workdir, Some(PathBuf::from("/tmp/proj")));
        assert_eq!(cli.host.as_deref(), Some("unix:///tmp/d.sock"));
    }

    #[test]
    fn test_exec_workdir_is_container_path() {
        let cli = Cli::try_parse_from(["agentbox", "exec", "-w", "/app", "web", "pwd"]).unwrap();
        let Some(ContainerCommand::Exec(args)) = cli.command.container() else {
            panic!("expected exec");
        };
        assert_eq!(args.workdir.as_deref(), Some("/app"));
        assert_eq!(cli.workdir, None);
    }
}
