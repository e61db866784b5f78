//! Interactive sessions.
//!
//! Binds host stdio to a container's streams for `run`, `start -a`,
//! `attach` and `exec`. A session attaches before it starts the container,
//! starts its pumps before the container runs, and always restores the
//! terminal as its last action.

pub mod detach;
pub mod pumps;

use crate::engine::{
    AttachOptions, ContainerRef, Engine, EngineError, ExecConfig, TerminalSize, WaitCondition,
};
use crate::terminal::{RawModeGuard, ResizeSubscription, Terminal, TerminalError};
use bytes::Bytes;
use detach::DetachKeys;
use futures::StreamExt;
use pumps::Pumps;
use std::future::Future;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for an exit notification after the stream closes.
pub const DETACH_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for pumps before restoring the terminal.
pub const RESTORE_TIMEOUT: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 4096;

/// Errors from session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },

    #[error("container {0} is not running")]
    ContainerNotRunning(String),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The process exited with this status.
    Exited(i64),
    /// The user detached; the container keeps running.
    Detached,
}

impl SessionOutcome {
    /// Exit status to propagate, if any. `None` for success and detach.
    #[must_use]
    pub fn failure_code(self) -> Option<i32> {
        match self {
            Self::Exited(0) | Self::Detached => None,
            Self::Exited(code) => Some(i32::try_from(code).unwrap_or(1)),
        }
    }
}

/// Options for a container session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Container was created with a TTY.
    pub tty: bool,
    /// Forward host stdin.
    pub stdin_open: bool,
    /// Container is removed on exit; wait for removal.
    pub auto_remove: bool,
    /// Issue the start call after attaching.
    pub start: bool,
    /// `None` disables detach detection.
    pub detach_keys: Option<DetachKeys>,
    pub detach_grace: Duration,
    pub restore_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tty: false,
            stdin_open: false,
            auto_remove: false,
            start: false,
            detach_keys: Some(DetachKeys::default()),
            detach_grace: DETACH_GRACE,
            restore_timeout: RESTORE_TIMEOUT,
        }
    }
}

/// Host-side streams for a session.
pub struct SessionIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SessionIo {
    /// The process's stdin, stdout and stderr.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            stdin: thread_reader(std::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

/// Read a blocking source on a detached thread.
///
/// A read left pending when the session ends stays on that thread, so it
/// never holds up runtime shutdown. The thread exits after its next read
/// once the returned reader is dropped.
pub fn thread_reader<R>(mut source: R) -> Box<dyn AsyncRead + Send + Unpin>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(1);
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let chunk = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
        debug!("input reader thread exited");
    });

    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Box::new(StreamReader::new(chunks.boxed()))
}

/// Run an engine call, giving up when `cancel` fires.
async fn call<T, F>(
    cancel: &CancellationToken,
    op: impl FnOnce() -> String,
    fut: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SessionError::Interrupted),
        result = fut => result.map_err(|source| SessionError::Engine { op: op(), source }),
    }
}

fn enter_raw_mode(terminal: &Terminal, wanted: bool) -> Result<Option<RawModeGuard>, SessionError> {
    if wanted && terminal.is_tty() {
        Ok(Some(terminal.setup()?))
    } else {
        Ok(None)
    }
}

/// Run an interactive session on a created or running container.
///
/// Order: attach, subscribe to exit, raw mode, pumps, start, initial resize,
/// resize forwarding. The session ends on exit, on stream close (after the
/// detach grace window), or on cancellation.
pub async fn run_container_session(
    engine: &dyn Engine,
    terminal: &Terminal,
    container: &ContainerRef,
    options: &SessionOptions,
    io: SessionIo,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SessionError> {
    let id = container.id.as_str();
    let name = container.name.as_str();

    let attach = AttachOptions {
        stdin: options.stdin_open,
        stdout: true,
        stderr: true,
        detach_keys: options.detach_keys.as_ref().map(|k| k.notation().to_string()),
    };
    let stream = call(
        cancel,
        || format!("attaching to container {name}"),
        engine.attach_container(id, &attach, options.tty),
    )
    .await?;
    debug!(container = %id, framed = stream.framed, "attached");

    let condition = WaitCondition::for_session(options.start, options.auto_remove);
    let wait = call(
        cancel,
        || format!("waiting for container {name}"),
        engine.wait_container(id, condition),
    )
    .await?;
    debug!(container = %id, condition = condition.as_str(), "exit listener registered");

    let mut raw = enter_raw_mode(terminal, options.tty && options.stdin_open)?;

    let session_cancel = cancel.child_token();
    let mut pumps = Pumps::start(
        stream,
        io,
        options.stdin_open,
        options.detach_keys.clone(),
        &session_cancel,
    );

    let result = drive_container(
        engine,
        terminal,
        container,
        options,
        wait.status(),
        &mut pumps,
        cancel,
    )
    .await;

    session_cancel.cancel();
    pumps.shutdown(options.restore_timeout).await;
    if let Some(guard) = raw.as_mut() {
        guard.restore();
    }
    debug!(container = %id, ?result, "session finished");
    result
}

async fn drive_container<W>(
    engine: &dyn Engine,
    terminal: &Terminal,
    container: &ContainerRef,
    options: &SessionOptions,
    wait: W,
    pumps: &mut Pumps,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SessionError>
where
    W: Future<Output = Result<i64, EngineError>>,
{
    let id = container.id.as_str();
    let name = container.name.as_str();

    if options.start {
        call(
            cancel,
            || format!("starting container {name}"),
            engine.start_container(id),
        )
        .await?;
        info!(container = %id, "started");
    }

    let (mut resize, _signals) = if options.tty && terminal.is_tty() {
        if let Err(e) = terminal
            .nudge(|size| engine.resize_container(id, size))
            .await
        {
            debug!("initial resize failed: {e}");
        }
        (Some(terminal.on_resize()), terminal.watch_resize_signals().ok())
    } else {
        (None, None)
    };

    tokio::pin!(wait);
    let detached = pumps.detached.clone();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Interrupted),
            status = &mut wait => {
                let status = status.map_err(|source| SessionError::Engine {
                    op: format!("waiting for container {name}"),
                    source,
                })?;
                debug!(container = %id, status, "exit observed, draining output");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(SessionError::Interrupted),
                    () = pumps.output_closed() => {}
                }
                return Ok(SessionOutcome::Exited(status));
            }
            () = pumps.output_closed(), if !pumps.output_finished() => break,
            () = detached.cancelled() => break,
            Some(size) = next_resize(&mut resize) => {
                forward_resize(size, |s| engine.resize_container(id, s)).await;
            }
        }
    }

    debug!(container = %id, "stream closed, waiting for exit");
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SessionError::Interrupted),
        status = tokio::time::timeout(options.detach_grace, &mut wait) => match status {
            Ok(Ok(status)) => Ok(SessionOutcome::Exited(status)),
            Ok(Err(source)) => Err(SessionError::Engine {
                op: format!("waiting for container {name}"),
                source,
            }),
            Err(_) => {
                info!(container = %id, "detached");
                Ok(SessionOutcome::Detached)
            }
        },
    }
}

async fn next_resize(
    subscription: &mut Option<ResizeSubscription>,
) -> Option<TerminalSize> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_resize<F, Fut>(size: TerminalSize, resize: F)
where
    F: FnOnce(TerminalSize) -> Fut,
    Fut: Future<Output = Result<(), EngineError>>,
{
    debug!(cols = size.cols, rows = size.rows, "forwarding resize");
    if let Err(e) = resize(size).await {
        debug!("resize failed: {e}");
    }
}

/// What to run in an exec session.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    pub tty: bool,
    pub interactive: bool,
    /// Start the process and return without attaching.
    pub detach: bool,
}

/// Run a process inside a running container.
///
/// In detach mode the exec ID is printed to stdout. Otherwise the session
/// streams until the process's output closes, then reads the exit code.
/// A failed exit-code lookup counts as success.
pub async fn run_exec_session(
    engine: &dyn Engine,
    terminal: &Terminal,
    container: &ContainerRef,
    request: &ExecRequest,
    options: &SessionOptions,
    mut io: SessionIo,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SessionError> {
    let name = container.name.as_str();
    if !container.is_running() {
        return Err(SessionError::ContainerNotRunning(name.to_string()));
    }

    let attach = !request.detach;
    let config = ExecConfig {
        attach_stdin: attach && request.interactive,
        attach_stdout: attach,
        attach_stderr: attach,
        tty: request.tty,
        privileged: request.privileged,
        cmd: request.cmd.clone(),
        env: request.env.clone(),
        working_dir: request.workdir.clone(),
        user: request.user.clone(),
        detach_keys: options.detach_keys.as_ref().map(|k| k.notation().to_string()),
    };
    let exec_id = call(
        cancel,
        || format!("creating exec in container {name}"),
        engine.create_exec(&container.id, &config),
    )
    .await?;
    debug!(exec = %exec_id, "exec created");

    if request.detach {
        call(
            cancel,
            || format!("starting exec {exec_id}"),
            engine.start_exec_detached(&exec_id),
        )
        .await?;
        io.stdout.write_all(format!("{exec_id}\n").as_bytes()).await?;
        io.stdout.flush().await?;
        return Ok(SessionOutcome::Detached);
    }

    let stream = call(
        cancel,
        || format!("starting exec {exec_id}"),
        engine.attach_exec(&exec_id, request.tty),
    )
    .await?;

    let mut raw = enter_raw_mode(terminal, request.tty && request.interactive)?;
    let session_cancel = cancel.child_token();
    let mut pumps = Pumps::start(
        stream,
        io,
        request.interactive,
        options.detach_keys.clone(),
        &session_cancel,
    );

    let result = drive_exec(engine, terminal, &exec_id, request, &mut pumps, cancel).await;

    session_cancel.cancel();
    pumps.shutdown(options.restore_timeout).await;
    if let Some(guard) = raw.as_mut() {
        guard.restore();
    }
    result
}

async fn drive_exec(
    engine: &dyn Engine,
    terminal: &Terminal,
    exec_id: &str,
    request: &ExecRequest,
    pumps: &mut Pumps,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SessionError> {
    let (mut resize, _signals) = if request.tty && terminal.is_tty() {
        // The process is already running: resize right away.
        if let Err(e) = terminal
            .nudge(|size| engine.resize_exec(exec_id, size))
            .await
        {
            debug!("initial exec resize failed: {e}");
        }
        (Some(terminal.on_resize()), terminal.watch_resize_signals().ok())
    } else {
        (None, None)
    };

    let detached = pumps.detached.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Interrupted),
            () = pumps.output_closed() => break,
            () = detached.cancelled() => break,
            Some(size) = next_resize(&mut resize) => {
                forward_resize(size, |s| engine.resize_exec(exec_id, s)).await;
            }
        }
    }

    let inspect = call(
        cancel,
        || format!("inspecting exec {exec_id}"),
        engine.inspect_exec(exec_id),
    )
    .await;
    match inspect {
        Ok(state) if state.running => {
            info!(exec = %exec_id, "detached from exec");
            Ok(SessionOutcome::Detached)
        }
        Ok(state) => Ok(SessionOutcome::Exited(state.exit_code.unwrap_or(0))),
        Err(SessionError::Interrupted) => Err(SessionError::Interrupted),
        Err(e) => {
            warn!("could not read exec exit code, assuming success: {e}");
            Ok(SessionOutcome::Exited(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_code() {
        assert_eq!(SessionOutcome::Exited(0).failure_code(), None);
        assert_eq!(SessionOutcome::Detached.failure_code(), None);
        assert_eq!(SessionOutcome::Exited(42).failure_code(), Some(42));
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.detach_grace, Duration::from_secs(2));
        assert_eq!(options.restore_timeout, Duration::from_millis(500));
        assert_eq!(options.detach_keys, Some(DetachKeys::default()));
    }
}
