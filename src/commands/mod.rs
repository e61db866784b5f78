//! Command surface.
//!
//! One function per subcommand. Each takes the already-parsed argument
//! struct and a [`Context`] carrying the engine, the terminal, resolved
//! configuration, the cancellation token and the host streams.

mod copy;
mod exec;
mod lifecycle;
mod query;

pub use lifecycle::parse_restart_policy;
pub use query::render_template;

use crate::cli::{Command, ContainerCommand};
use crate::config::{resolve_detach_keys, ResolvedConfig};
use crate::engine::{ContainerRef, Engine, EngineError};
use crate::error::{Error, Result};
use crate::names::{resolve_container_name, LABEL_PROJECT};
use crate::session::detach::DetachKeys;
use crate::session::{SessionIo, SessionOutcome};
use crate::terminal::Terminal;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Produces host streams for a command.
pub type IoFactory = Arc<dyn Fn() -> SessionIo + Send + Sync>;

/// Everything a command needs from its environment.
#[derive(Clone)]
pub struct Context {
    pub engine: Arc<dyn Engine>,
    pub terminal: Terminal,
    pub config: ResolvedConfig,
    pub cancel: CancellationToken,
    io: IoFactory,
}

impl Context {
    /// A context bound to the process's stdio.
    pub fn new(
        engine: Arc<dyn Engine>,
        terminal: Terminal,
        config: ResolvedConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            terminal,
            config,
            cancel,
            io: Arc::new(SessionIo::stdio),
        }
    }

    /// Replace the host streams.
    #[must_use]
    pub fn with_io(mut self, io: impl Fn() -> SessionIo + Send + Sync + 'static) -> Self {
        self.io = Arc::new(io);
        self
    }

    #[must_use]
    pub fn io(&self) -> SessionIo {
        (self.io)()
    }

    #[must_use]
    pub fn project_key(&self) -> &str {
        &self.config.project.key
    }

    /// Label filter selecting the current project's containers.
    #[must_use]
    pub fn project_filter(&self) -> Vec<String> {
        vec![format!("{LABEL_PROJECT}={}", self.project_key())]
    }

    /// Map a container argument to an engine reference.
    #[must_use]
    pub fn target(&self, arg: &str, agent: bool) -> String {
        if agent {
            resolve_container_name(self.project_key(), arg)
        } else {
            arg.to_string()
        }
    }

    #[must_use]
    pub fn targets(&self, args: &[String], agent: bool) -> Vec<String> {
        args.iter().map(|arg| self.target(arg, agent)).collect()
    }

    /// Detach keys from the flag, settings or default.
    pub fn detach_keys(&self, flag: Option<&str>) -> Result<DetachKeys> {
        let notation = resolve_detach_keys(flag, &self.config.settings);
        DetachKeys::parse(&notation)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid detach keys {notation:?}")))
    }

    /// Await an engine call, wrapping failures with `op` and giving up on
    /// cancellation.
    pub async fn call<T, F>(&self, op: impl FnOnce() -> String, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Interrupted),
            result = fut => result.map_err(|source| Error::engine(op(), source)),
        }
    }

    /// Await any fallible future, giving up on cancellation.
    pub async fn cancellable<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T, E>>,
        Error: From<E>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Interrupted),
            result = fut => Ok(result?),
        }
    }

    /// Resolve a name or ID to the engine's current view.
    pub async fn inspect(&self, target: &str) -> Result<ContainerRef> {
        self.call(
            || format!("inspecting container {target}"),
            self.engine.inspect_container(target),
        )
        .await
    }
}

/// Collects per-item results of a bulk operation.
///
/// Successes print a line on stdout, failures print `Error: ...` on stderr.
/// Cancellation aborts the whole operation.
pub(crate) struct Bulk<'a> {
    io: &'a mut SessionIo,
    total: usize,
    failed: usize,
}

impl<'a> Bulk<'a> {
    pub(crate) const fn new(io: &'a mut SessionIo) -> Self {
        Self {
            io,
            total: 0,
            failed: 0,
        }
    }

    pub(crate) async fn record(&mut self, result: Result<Option<String>>) -> Result<()> {
        self.total += 1;
        match result {
            Ok(Some(line)) => {
                self.io.stdout.write_all(format!("{line}\n").as_bytes()).await?;
                self.io.stdout.flush().await?;
            }
            Ok(None) => {}
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                self.failed += 1;
                self.io.stderr.write_all(format!("Error: {e}\n").as_bytes()).await?;
                self.io.stderr.flush().await?;
            }
        }
        Ok(())
    }

    pub(crate) const fn finish(self) -> Result<()> {
        if self.failed == 0 {
            Ok(())
        } else {
            Err(Error::Partial {
                failed: self.failed,
                total: self.total,
            })
        }
    }
}

/// Write `text` to stdout.
pub(crate) async fn print(io: &mut SessionIo, text: &str) -> Result<()> {
    io.stdout.write_all(text.as_bytes()).await?;
    io.stdout.flush().await?;
    Ok(())
}

/// Write `text` to stderr.
pub(crate) async fn eprint(io: &mut SessionIo, text: &str) -> Result<()> {
    io.stderr.write_all(text.as_bytes()).await?;
    io.stderr.flush().await?;
    Ok(())
}

/// Turn a session outcome into the command result.
pub(crate) fn finish(outcome: SessionOutcome) -> Result<()> {
    match outcome.failure_code() {
        Some(code) => Err(Error::Exit(code)),
        None => Ok(()),
    }
}

/// Run a parsed command.
pub async fn dispatch(ctx: &Context, command: &Command) -> Result<()> {
    match command {
        Command::Container(cmd) | Command::Direct(cmd) => run_container_command(ctx, cmd).await,
        Command::Rmi(args) => lifecycle::rmi(ctx, args).await,
    }
}

async fn run_container_command(ctx: &Context, command: &ContainerCommand) -> Result<()> {
    debug!(?command, "dispatching");
    match command {
        ContainerCommand::Run(args) => lifecycle::run(ctx, args).await,
        ContainerCommand::Create(args) => lifecycle::create(ctx, args).await,
        ContainerCommand::Start(args) => lifecycle::start(ctx, args).await,
        ContainerCommand::Stop(args) => lifecycle::stop(ctx, args).await,
        ContainerCommand::Restart(args) => lifecycle::restart(ctx, args).await,
        ContainerCommand::Kill(args) => lifecycle::kill(ctx, args).await,
        ContainerCommand::Pause(args) => lifecycle::pause(ctx, args).await,
        ContainerCommand::Unpause(args) => lifecycle::unpause(ctx, args).await,
        ContainerCommand::Rename(args) => lifecycle::rename(ctx, args).await,
        ContainerCommand::Rm(args) => lifecycle::rm(ctx, args).await,
        ContainerCommand::Wait(args) => lifecycle::wait(ctx, args).await,
        ContainerCommand::Exec(args) => exec::exec(ctx, args).await,
        ContainerCommand::Attach(args) => exec::attach(ctx, args).await,
        ContainerCommand::Cp(args) => copy::cp(ctx, args).await,
        ContainerCommand::Logs(args) => query::logs(ctx, args).await,
        ContainerCommand::Ps(args) => query::ps(ctx, args).await,
        ContainerCommand::Inspect(args) => query::inspect(ctx, args).await,
        ContainerCommand::Stats(args) => query::stats(ctx, args).await,
        ContainerCommand::Top(args) => query::top(ctx, args).await,
    }
}
