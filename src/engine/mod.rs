//! Container engine access.
//!
//! [`Engine`] is the contract the rest of the crate consumes. [`DockerEngine`]
//! implements it over the engine's HTTP API on a unix socket; the `testing`
//! module provides an in-process fake.

mod client;
pub mod frame;
pub mod types;

pub use client::{default_socket_path, DockerEngine, API_VERSION};
pub use types::*;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Errors returned by engine calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connecting to engine at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[source] hyper::Error),

    #[error("failed to build request: {0}")]
    Request(String),

    #[error("no such file or directory in container: {0}")]
    PathNotFound(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid engine response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("stream upgrade failed: {0}")]
    Upgrade(String),

    #[error("wait failed: {0}")]
    Wait(String),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl EngineError {
    /// Whether the error means the engine could not be reached at all.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Read half of an engine stream.
pub type StreamReader = Pin<Box<dyn AsyncRead + Send>>;
/// Write half of an engine stream.
pub type StreamWriter = Pin<Box<dyn AsyncWrite + Send>>;
/// Tar archive byte stream.
pub type ArchiveReader = Pin<Box<dyn AsyncRead + Send>>;

/// The bidirectional stream returned by attach and exec-attach.
///
/// Shutting down `writer` half-closes the connection: the container sees
/// EOF on stdin while output keeps flowing.
pub struct HijackedStream {
    pub reader: StreamReader,
    pub writer: StreamWriter,
    /// Framed (8-byte headers) iff the container has no TTY.
    pub framed: bool,
}

impl HijackedStream {
    pub fn new<R, W>(reader: R, writer: W, tty: bool) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            framed: !tty,
        }
    }
}

impl std::fmt::Debug for HijackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedStream")
            .field("framed", &self.framed)
            .finish_non_exhaustive()
    }
}

/// Pending exit notification.
///
/// The wait request is registered with the engine before the handle is
/// returned, so a container started afterwards cannot exit unobserved.
pub struct WaitHandle {
    rx: oneshot::Receiver<Result<i64, EngineError>>,
}

impl WaitHandle {
    #[must_use]
    pub const fn new(rx: oneshot::Receiver<Result<i64, EngineError>>) -> Self {
        Self { rx }
    }

    /// Wait for the exit status.
    pub async fn status(self) -> Result<i64, EngineError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Wait("wait listener dropped".into())))
    }
}

/// Label filters in `key=value` (or bare `key`) form.
pub type LabelFilters = [String];

/// Operations the core consumes from the container engine.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    /// Resolve a name or ID to the engine's view of the container.
    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerRef, EngineError>;

    /// Full inspect document, used for template formatting.
    async fn inspect_container_raw(&self, name_or_id: &str)
        -> Result<serde_json::Value, EngineError>;

    async fn list_containers(
        &self,
        all: bool,
        labels: &LabelFilters,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str, timeout: Option<i64>) -> Result<(), EngineError>;

    async fn restart_container(&self, id: &str, timeout: Option<i64>) -> Result<(), EngineError>;

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<(), EngineError>;

    async fn pause_container(&self, id: &str) -> Result<(), EngineError>;

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError>;

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool, volumes: bool)
        -> Result<(), EngineError>;

    async fn wait_container(
        &self,
        id: &str,
        condition: WaitCondition,
    ) -> Result<WaitHandle, EngineError>;

    async fn attach_container(
        &self,
        id: &str,
        options: &AttachOptions,
        tty: bool,
    ) -> Result<HijackedStream, EngineError>;

    async fn resize_container(&self, id: &str, size: TerminalSize) -> Result<(), EngineError>;

    async fn create_exec(&self, id: &str, config: &ExecConfig) -> Result<String, EngineError>;

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), EngineError>;

    /// Start an exec instance and hijack its stream.
    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedStream, EngineError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, EngineError>;

    async fn resize_exec(&self, exec_id: &str, size: TerminalSize) -> Result<(), EngineError>;

    async fn stats_once(&self, id: &str) -> Result<StatsSample, EngineError>;

    /// Open a streaming stats call. Dropping the stream closes it.
    async fn stats_stream(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError>;

    async fn top(&self, id: &str, ps_args: Option<&str>) -> Result<TopResponse, EngineError>;

    /// Raw log bytes; framed iff the container has no TTY.
    async fn logs(
        &self,
        id: &str,
        options: &LogsOptions,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError>;

    async fn stat_container_path(&self, id: &str, path: &str) -> Result<PathStat, EngineError>;

    async fn copy_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<(PathStat, ArchiveReader), EngineError>;

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: ArchiveReader,
        options: CopyToOptions,
    ) -> Result<(), EngineError>;

    async fn list_images(&self, labels: &LabelFilters) -> Result<Vec<ImageSummary>, EngineError>;

    async fn remove_image(&self, name: &str, force: bool)
        -> Result<Vec<ImageDeleteItem>, EngineError>;
}
