//! In-process fakes for testing sessions, stats and copies.
//!
//! [`FakeEngine`] simulates the container engine behind the [`Engine`]
//! trait and records every call in order:
//!
//! ```ignore
//! let engine = FakeEngine::new();
//! let web = engine.add_container(
//!     ContainerSpec::new("web").tty(true).script(Script::exits(42).prints(StreamKind::Stdout, "hi")),
//! );
//! let outcome = run_container_session(&engine, &terminal, &web, &options, io, &cancel).await?;
//! assert!(engine.called_before(&Call::Attach(web.id.clone()), &Call::Start(web.id.clone())));
//! ```
//!
//! [`FakeTerminal`] stands in for the host terminal and [`SharedBuf`]
//! captures session output.

use crate::engine::frame::{encode_frame, StreamKind};
use crate::engine::{
    ArchiveReader, AttachOptions, ContainerRef, ContainerState,
    ContainerSummary, CopyToOptions, CreateContainerRequest, CreateContainerResponse, Engine,
    EngineError, ExecConfig, ExecInspect, HijackedStream, ImageDeleteItem, ImageSummary,
    LabelFilters, LogsOptions, PathStat, StatsSample, TerminalSize, TopResponse, WaitCondition,
    WaitHandle,
};
use crate::terminal::{TerminalBackend, TerminalError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A deterministic 64-character hex ID.
#[must_use]
pub fn fake_id(n: u64) -> String {
    let seed = n.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15) | (1 << 63);
    let words = [seed, !seed, seed.rotate_left(17), seed.rotate_left(41)];
    hex::encode(words.iter().flat_map(|w| w.to_be_bytes()).collect::<Vec<u8>>())
}

// -----------------------------------------------------------------------
// Process scripts
// -----------------------------------------------------------------------

/// What a simulated process does once started.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Written to attached streams in order, framed when there is no TTY.
    pub output: Vec<(StreamKind, Vec<u8>)>,
    /// Written to streams that attach after the process started.
    pub on_attach: Vec<u8>,
    /// Echo stdin back on stdout. Without `hold`, the process exits at
    /// stdin EOF.
    pub echo_stdin: bool,
    /// Keep running until stopped. Stdin EOF closes the stream instead.
    pub hold: bool,
    pub exit_code: i64,
    /// Run time for processes that neither echo nor hold.
    pub run_time: Duration,
}

impl Script {
    #[must_use]
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// A process that runs until stopped.
    #[must_use]
    pub fn held() -> Self {
        Self {
            hold: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn prints(mut self, kind: StreamKind, data: impl AsRef<[u8]>) -> Self {
        self.output.push((kind, data.as_ref().to_vec()));
        self
    }

    #[must_use]
    pub const fn echo(mut self) -> Self {
        self.echo_stdin = true;
        self
    }

    #[must_use]
    pub fn greets(mut self, data: impl AsRef<[u8]>) -> Self {
        self.on_attach = data.as_ref().to_vec();
        self
    }

    #[must_use]
    pub const fn runs_for(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }
}

/// A container to seed into the fake.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub id: Option<String>,
    pub image: String,
    pub tty: bool,
    pub open_stdin: bool,
    pub auto_remove: bool,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub script: Script,
    pub exec_script: Script,
    pub stats: Vec<StatsSample>,
    pub stats_fail: bool,
    pub start_fail: bool,
    pub exec_inspect_fail: bool,
}

impl ContainerSpec {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            image: "alpine:latest".to_string(),
            tty: false,
            open_stdin: false,
            auto_remove: false,
            running: false,
            labels: HashMap::new(),
            script: Script::default(),
            exec_script: Script::default(),
            stats: Vec::new(),
            stats_fail: false,
            start_fail: false,
            exec_inspect_fail: false,
        }
    }

    #[must_use]
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    #[must_use]
    pub const fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    #[must_use]
    pub const fn open_stdin(mut self, open: bool) -> Self {
        self.open_stdin = open;
        self
    }

    #[must_use]
    pub const fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    #[must_use]
    pub const fn running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    #[must_use]
    pub fn exec_script(mut self, script: Script) -> Self {
        self.exec_script = script;
        self
    }

    #[must_use]
    pub fn stats(mut self, sample: StatsSample) -> Self {
        self.stats.push(sample);
        self
    }

    #[must_use]
    pub const fn failing_stats(mut self) -> Self {
        self.stats_fail = true;
        self
    }

    /// Start calls fail with a server error.
    #[must_use]
    pub const fn failing_start(mut self) -> Self {
        self.start_fail = true;
        self
    }

    /// Exec inspect calls fail with a server error.
    #[must_use]
    pub const fn failing_exec_inspect(mut self) -> Self {
        self.exec_inspect_fail = true;
        self
    }
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    Inspect(String),
    List,
    Create { name: Option<String>, image: String },
    Start(String),
    Stop(String),
    Restart(String),
    Kill(String, Option<String>),
    Pause(String),
    Unpause(String),
    Rename(String, String),
    Remove(String),
    Wait(String, WaitCondition),
    Attach(String),
    Resize(String, TerminalSize),
    CreateExec(String, Vec<String>),
    StartExec(String),
    AttachExec(String),
    InspectExec(String),
    ResizeExec(String, TerminalSize),
    Stats(String),
    StatsStream(String),
    Top(String),
    Logs(String),
    StatPath(String, String),
    CopyFrom(String, String),
    CopyTo(String, String),
    ListImages,
    RemoveImage(String),
}

// -----------------------------------------------------------------------
// Engine state
// -----------------------------------------------------------------------

#[derive(Clone)]
struct Run {
    stop: CancellationToken,
    exited: CancellationToken,
    done: CancellationToken,
}

impl Run {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            exited: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }
}

struct FakeContainer {
    id: String,
    name: String,
    image: String,
    state: ContainerState,
    tty: bool,
    open_stdin: bool,
    auto_remove: bool,
    labels: HashMap<String, String>,
    exit_code: i64,
    created: i64,
    script: Script,
    exec_script: Script,
    logs: Vec<u8>,
    stats: Vec<StatsSample>,
    stats_fail: bool,
    start_fail: bool,
    exec_inspect_fail: bool,
    run: Option<Run>,
}

impl FakeContainer {
    fn to_ref(&self) -> ContainerRef {
        ContainerRef {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            tty: self.tty,
        }
    }

    fn matches(&self, name_or_id: &str) -> bool {
        let name = name_or_id.strip_prefix('/').unwrap_or(name_or_id);
        self.name == name || (!name_or_id.is_empty() && self.id.starts_with(name_or_id))
    }
}

struct Attachment {
    output: DuplexStream,
    input: Option<DuplexStream>,
}

struct Waiter {
    id: String,
    condition: WaitCondition,
    tx: oneshot::Sender<Result<i64, EngineError>>,
}

struct FakeExec {
    container: String,
    config: ExecConfig,
    script: Script,
    running: bool,
    exit_code: Option<i64>,
    inspect_fail: bool,
}

#[derive(Default)]
struct State {
    containers: Vec<FakeContainer>,
    waiters: Vec<Waiter>,
    pending: HashMap<String, Vec<Attachment>>,
    execs: HashMap<String, FakeExec>,
    images: Vec<ImageSummary>,
    image_scripts: HashMap<String, Script>,
    calls: Vec<Call>,
    next_id: u64,
    fs_root: Option<PathBuf>,
}

impl State {
    fn find(&self, name_or_id: &str) -> Result<&FakeContainer, EngineError> {
        self.containers
            .iter()
            .find(|c| c.matches(name_or_id))
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))
    }

    fn find_mut(&mut self, name_or_id: &str) -> Result<&mut FakeContainer, EngineError> {
        self.containers
            .iter_mut()
            .find(|c| c.matches(name_or_id))
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))
    }

    fn new_id(&mut self) -> String {
        let id = fake_id(self.next_id);
        self.next_id += 1;
        id
    }

    fn resolve_waiters(&mut self, id: &str, conditions: &[WaitCondition], code: i64) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.id == id && conditions.contains(&w.condition));
        self.waiters = rest;
        for waiter in ready {
            let _ = waiter.tx.send(Ok(code));
        }
    }
}

fn conflict(message: impl Into<String>) -> EngineError {
    EngineError::Api {
        status: 409,
        message: message.into(),
    }
}

/// In-process container engine.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<State>>,
    open_streams: Arc<AtomicUsize>,
    stats_interval: Duration,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            open_streams: Arc::new(AtomicUsize::new(0)),
            stats_interval: Duration::from_millis(50),
        }
    }

    /// Back container filesystems with directories under `root`.
    #[must_use]
    pub fn with_filesystem(self, root: impl Into<PathBuf>) -> Self {
        self.lock().fs_root = Some(root.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    /// Seed a container. Running containers start their script immediately.
    pub fn add_container(&self, spec: ContainerSpec) -> ContainerRef {
        let container = {
            let mut state = self.lock();
            let id = spec.id.clone().unwrap_or_else(|| state.new_id());
            let created = i64::try_from(state.containers.len()).unwrap_or(0) + 1_700_000_000;
            let container = FakeContainer {
                id,
                name: spec.name,
                image: spec.image,
                state: ContainerState::Created,
                tty: spec.tty,
                open_stdin: spec.open_stdin,
                auto_remove: spec.auto_remove,
                labels: spec.labels,
                exit_code: 0,
                created,
                script: spec.script,
                exec_script: spec.exec_script,
                logs: Vec::new(),
                stats: spec.stats,
                stats_fail: spec.stats_fail,
                start_fail: spec.start_fail,
                exec_inspect_fail: spec.exec_inspect_fail,
                run: None,
            };
            let r = container.to_ref();
            state.containers.push(container);
            r
        };
        if spec.running {
            launch(&self.state, &container.id);
            return self.container(&container.id).unwrap_or(container);
        }
        container
    }

    pub fn add_image(&self, image: ImageSummary) {
        self.lock().images.push(image);
    }

    /// Script for containers created from `image`.
    pub fn image_script(&self, image: &str, script: Script) {
        self.lock().image_scripts.insert(image.to_string(), script);
    }

    /// Current view of a container, if it exists.
    #[must_use]
    pub fn container(&self, name_or_id: &str) -> Option<ContainerRef> {
        self.lock().find(name_or_id).ok().map(FakeContainer::to_ref)
    }

    #[must_use]
    pub fn exists(&self, name_or_id: &str) -> bool {
        self.container(name_or_id).is_some()
    }

    /// Labels of a container.
    #[must_use]
    pub fn labels(&self, name_or_id: &str) -> HashMap<String, String> {
        self.lock()
            .find(name_or_id)
            .map(|c| c.labels.clone())
            .unwrap_or_default()
    }

    /// Host directory backing `/` of a container.
    pub fn container_root(&self, name_or_id: &str) -> Result<PathBuf, EngineError> {
        let state = self.lock();
        let id = state.find(name_or_id)?.id.clone();
        let root = state
            .fs_root
            .as_ref()
            .ok_or_else(|| EngineError::Request("fake engine has no filesystem".into()))?
            .join(id);
        std::fs::create_dir_all(&root).map_err(EngineError::Io)?;
        Ok(root)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn position(&self, call: &Call) -> Option<usize> {
        self.lock().calls.iter().position(|c| c == call)
    }

    /// Whether `first` was recorded before `second`. Both must be present.
    #[must_use]
    pub fn called_before(&self, first: &Call, second: &Call) -> bool {
        matches!((self.position(first), self.position(second)), (Some(a), Some(b)) if a < b)
    }

    /// Exec configurations created so far.
    #[must_use]
    pub fn exec_configs(&self) -> Vec<ExecConfig> {
        self.lock().execs.values().map(|e| e.config.clone()).collect()
    }

    /// Number of stats streams currently open.
    #[must_use]
    pub fn open_stats_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn fs_path(&self, id: &str, path: &str) -> Result<PathBuf, EngineError> {
        let root = self.container_root(id)?;
        let relative = path.trim_start_matches('/');
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(EngineError::Request(format!("path escapes container: {path}")));
        }
        Ok(if relative.is_empty() {
            root
        } else {
            root.join(relative)
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn emit(out: &mut DuplexStream, tty: bool, kind: StreamKind, data: &[u8]) -> io::Result<()> {
    if tty {
        out.write_all(data).await
    } else {
        out.write_all(&encode_frame(kind, data)).await
    }
}

fn log_bytes(tty: bool, output: &[(StreamKind, Vec<u8>)]) -> Vec<u8> {
    output
        .iter()
        .flat_map(|(kind, data)| {
            if tty {
                data.clone()
            } else {
                encode_frame(*kind, data)
            }
        })
        .collect()
}

/// Serve one attached stream until the process exits.
///
/// Stdin EOF on a held process closes the stream early, the way the engine
/// drops a connection on detach.
async fn serve(
    mut attachment: Attachment,
    output: Vec<(StreamKind, Vec<u8>)>,
    echo: bool,
    hold: bool,
    tty: bool,
    exited: CancellationToken,
    stdin_closed: CancellationToken,
) {
    for (kind, data) in &output {
        if emit(&mut attachment.output, tty, *kind, data).await.is_err() {
            return;
        }
    }

    if let Some(mut input) = attachment.input.take() {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                biased;
                () = exited.cancelled() => return,
                read = input.read(&mut buf) => match read {
                    Ok(0) | Err(_) => {
                        stdin_closed.cancel();
                        if hold {
                            return;
                        }
                        break;
                    }
                    Ok(n) => {
                        if echo
                            && emit(&mut attachment.output, tty, StreamKind::Stdout, &buf[..n])
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                },
            }
        }
    }

    exited.cancelled().await;
}

/// Start a created or exited container's script.
fn launch(state: &Arc<Mutex<State>>, id: &str) {
    let (script, tty, attachments, run, id) = {
        let mut st = lock(state);
        let Ok(container) = st.find_mut(id) else {
            return;
        };
        if container.state == ContainerState::Running {
            return;
        }
        let run = Run::new();
        container.state = ContainerState::Running;
        container.run = Some(run.clone());
        let log = log_bytes(container.tty, &container.script.output);
        container.logs.extend(log);
        let script = container.script.clone();
        let tty = container.tty;
        let id = container.id.clone();
        let attachments = st.pending.remove(&id).unwrap_or_default();
        (script, tty, attachments, run, id)
    };

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let stdin_closed = CancellationToken::new();
        let has_stdin = attachments.iter().any(|a| a.input.is_some());
        let serving: Vec<_> = attachments
            .into_iter()
            .map(|attachment| {
                tokio::spawn(serve(
                    attachment,
                    script.output.clone(),
                    script.echo_stdin,
                    script.hold,
                    tty,
                    run.exited.clone(),
                    stdin_closed.clone(),
                ))
            })
            .collect();

        tokio::select! {
            () = run.stop.cancelled() => {}
            () = async {
                if script.hold {
                    std::future::pending::<()>().await;
                } else if script.echo_stdin && has_stdin {
                    stdin_closed.cancelled().await;
                } else {
                    tokio::time::sleep(script.run_time).await;
                }
            } => {}
        }

        run.exited.cancel();
        for handle in serving {
            let _ = handle.await;
        }
        finish(&state, &id, script.exit_code);
        run.done.cancel();
    });
}

fn finish(state: &Mutex<State>, id: &str, code: i64) {
    let mut st = lock(state);
    let Ok(container) = st.find_mut(id) else {
        return;
    };
    container.state = ContainerState::Exited;
    container.exit_code = code;
    container.run = None;
    let auto_remove = container.auto_remove;
    st.resolve_waiters(id, &[WaitCondition::NotRunning, WaitCondition::NextExit], code);
    if auto_remove {
        st.containers.retain(|c| c.id != id);
        st.resolve_waiters(id, &[WaitCondition::Removed], code);
    }
}

/// Stop a running container and wait for its script to finish.
async fn halt(state: &Arc<Mutex<State>>, id: &str) -> Result<(), EngineError> {
    let run = lock(state).find(id)?.run.clone();
    if let Some(run) = run {
        run.stop.cancel();
        run.done.cancelled().await;
    }
    Ok(())
}

fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    let mut mode = meta.permissions().mode() & 0o777;
    if meta.is_dir() {
        mode |= 1 << 31;
    }
    if meta.file_type().is_symlink() {
        mode |= 1 << 27;
    }
    mode
}

fn archive_name(path: &str) -> String {
    Path::new(path.trim_end_matches('/'))
        .file_name()
        .map_or_else(|| ".".to_string(), |n| n.to_string_lossy().into_owned())
}

/// Closes the open-stream count when a stats stream is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.record(Call::Ping);
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerRef, EngineError> {
        self.record(Call::Inspect(name_or_id.to_string()));
        self.lock().find(name_or_id).map(FakeContainer::to_ref)
    }

    async fn inspect_container_raw(
        &self,
        name_or_id: &str,
    ) -> Result<serde_json::Value, EngineError> {
        self.record(Call::Inspect(name_or_id.to_string()));
        let state = self.lock();
        let c = state.find(name_or_id)?;
        Ok(serde_json::json!({
            "Id": c.id,
            "Name": format!("/{}", c.name),
            "Created": c.created,
            "State": {
                "Status": c.state.to_string(),
                "Running": c.state == ContainerState::Running,
                "ExitCode": c.exit_code,
            },
            "Config": {
                "Image": c.image,
                "Tty": c.tty,
                "OpenStdin": c.open_stdin,
                "Labels": c.labels,
            },
            "HostConfig": { "AutoRemove": c.auto_remove },
        }))
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &LabelFilters,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record(Call::List);
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.state == ContainerState::Running)
            .filter(|c| labels.iter().all(|f| label_matches(&c.labels, f)))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: c.image.clone(),
                command: "sh".to_string(),
                created: c.created,
                state: c.state.to_string(),
                status: c.state.to_string(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError> {
        self.record(Call::Create {
            name: name.map(str::to_string),
            image: config.image.clone(),
        });
        let mut state = self.lock();
        if let Some(name) = name {
            if state.containers.iter().any(|c| c.name == name) {
                return Err(conflict(format!(
                    "Conflict. The container name \"/{name}\" is already in use"
                )));
            }
        }
        let id = state.new_id();
        let name = name.map_or_else(|| format!("fake_{}", &id[..8]), str::to_string);
        let created = i64::try_from(state.containers.len()).unwrap_or(0) + 1_700_000_000;
        let script = state.image_scripts.get(&config.image).cloned().unwrap_or_default();
        state.containers.push(FakeContainer {
            id: id.clone(),
            name,
            image: config.image.clone(),
            state: ContainerState::Created,
            tty: config.tty,
            open_stdin: config.open_stdin,
            auto_remove: config.host_config.auto_remove,
            labels: config.labels.clone(),
            exit_code: 0,
            created,
            script,
            exec_script: Script::default(),
            logs: Vec::new(),
            stats: Vec::new(),
            stats_fail: false,
            start_fail: false,
            exec_inspect_fail: false,
            run: None,
        });
        Ok(CreateContainerResponse { id, warnings: None })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(Call::Start(id.to_string()));
        let (full, fail) = {
            let state = self.lock();
            let c = state.find(id)?;
            (c.id.clone(), c.start_fail)
        };
        if fail {
            return Err(EngineError::Api {
                status: 500,
                message: format!("cannot start container {id}"),
            });
        }
        launch(&self.state, &full);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Option<i64>) -> Result<(), EngineError> {
        self.record(Call::Stop(id.to_string()));
        halt(&self.state, id).await
    }

    async fn restart_container(&self, id: &str, _timeout: Option<i64>) -> Result<(), EngineError> {
        self.record(Call::Restart(id.to_string()));
        halt(&self.state, id).await?;
        let full = self.lock().find(id)?.id.clone();
        launch(&self.state, &full);
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<(), EngineError> {
        self.record(Call::Kill(id.to_string(), signal.map(str::to_string)));
        if self.lock().find(id)?.state != ContainerState::Running {
            return Err(conflict(format!("Container {id} is not running")));
        }
        halt(&self.state, id).await
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(Call::Pause(id.to_string()));
        let mut state = self.lock();
        let c = state.find_mut(id)?;
        if c.state != ContainerState::Running {
            return Err(conflict(format!("Container {id} is not running")));
        }
        c.state = ContainerState::Paused;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(Call::Unpause(id.to_string()));
        let mut state = self.lock();
        let c = state.find_mut(id)?;
        if c.state != ContainerState::Paused {
            return Err(conflict(format!("Container {id} is not paused")));
        }
        c.state = ContainerState::Running;
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), EngineError> {
        self.record(Call::Rename(id.to_string(), new_name.to_string()));
        let mut state = self.lock();
        if state.containers.iter().any(|c| c.name == new_name) {
            return Err(conflict(format!("name \"{new_name}\" is already in use")));
        }
        state.find_mut(id)?.name = new_name.to_string();
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        _volumes: bool,
    ) -> Result<(), EngineError> {
        self.record(Call::Remove(id.to_string()));
        let (full, running) = {
            let state = self.lock();
            let c = state.find(id)?;
            (c.id.clone(), c.state == ContainerState::Running)
        };
        if running {
            if !force {
                return Err(conflict(format!(
                    "cannot remove container {id}: container is running"
                )));
            }
            halt(&self.state, &full).await?;
        }
        let mut state = self.lock();
        let code = state.find(&full).map_or(0, |c| c.exit_code);
        state.containers.retain(|c| c.id != full);
        state.resolve_waiters(&full, &[WaitCondition::Removed], code);
        Ok(())
    }

    async fn wait_container(
        &self,
        id: &str,
        condition: WaitCondition,
    ) -> Result<WaitHandle, EngineError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let (full, current, code) = {
            let c = state.find(id)?;
            (c.id.clone(), c.state, c.exit_code)
        };
        state.calls.push(Call::Wait(full.clone(), condition));
        if condition == WaitCondition::NotRunning && current != ContainerState::Running {
            let _ = tx.send(Ok(code));
        } else {
            state.waiters.push(Waiter {
                id: full,
                condition,
                tx,
            });
        }
        Ok(WaitHandle::new(rx))
    }

    async fn attach_container(
        &self,
        id: &str,
        options: &AttachOptions,
        tty: bool,
    ) -> Result<HijackedStream, EngineError> {
        let (engine_out, client_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_out, engine_in) = tokio::io::duplex(PIPE_CAPACITY);
        let attachment = Attachment {
            output: engine_out,
            input: options.stdin.then_some(engine_in),
        };

        let mut state = self.lock();
        let c = state.find(id)?;
        let full = c.id.clone();
        let live = c
            .run
            .clone()
            .filter(|_| matches!(c.state, ContainerState::Running | ContainerState::Paused));
        let greeting = if c.script.on_attach.is_empty() {
            Vec::new()
        } else {
            vec![(StreamKind::Stdout, c.script.on_attach.clone())]
        };
        let (echo, container_tty) = (c.script.echo_stdin, c.tty);
        state.calls.push(Call::Attach(full.clone()));

        match live {
            Some(run) => {
                tokio::spawn(serve(
                    attachment,
                    greeting,
                    echo,
                    true,
                    container_tty,
                    run.exited,
                    CancellationToken::new(),
                ));
            }
            None => state.pending.entry(full).or_default().push(attachment),
        }
        Ok(HijackedStream::new(client_in, client_out, tty))
    }

    async fn resize_container(&self, id: &str, size: TerminalSize) -> Result<(), EngineError> {
        self.record(Call::Resize(id.to_string(), size));
        Ok(())
    }

    async fn create_exec(&self, id: &str, config: &ExecConfig) -> Result<String, EngineError> {
        self.record(Call::CreateExec(id.to_string(), config.cmd.clone()));
        let mut state = self.lock();
        let c = state.find(id)?;
        if c.state != ContainerState::Running {
            return Err(conflict(format!("Container {id} is not running")));
        }
        let container = c.id.clone();
        let script = c.exec_script.clone();
        let inspect_fail = c.exec_inspect_fail;
        let exec_id = state.new_id();
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                container,
                config: config.clone(),
                script,
                running: false,
                exit_code: None,
                inspect_fail,
            },
        );
        Ok(exec_id)
    }

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), EngineError> {
        self.record(Call::StartExec(exec_id.to_string()));
        let (script, container_run) = self.begin_exec(exec_id)?;
        let state = Arc::clone(&self.state);
        let exec_id = exec_id.to_string();
        tokio::spawn(async move {
            if script.hold {
                if let Some(run) = container_run {
                    run.exited.cancelled().await;
                }
            } else {
                tokio::time::sleep(script.run_time).await;
            }
            end_exec(&state, &exec_id, script.exit_code);
        });
        Ok(())
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedStream, EngineError> {
        self.record(Call::AttachExec(exec_id.to_string()));
        let attach_stdin = self
            .lock()
            .execs
            .get(exec_id)
            .map(|e| e.config.attach_stdin)
            .ok_or_else(|| EngineError::NotFound(exec_id.to_string()))?;
        let (script, container_run) = self.begin_exec(exec_id)?;

        let (engine_out, client_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_out, engine_in) = tokio::io::duplex(PIPE_CAPACITY);
        let attachment = Attachment {
            output: engine_out,
            input: attach_stdin.then_some(engine_in),
        };

        let state = Arc::clone(&self.state);
        let exec_id = exec_id.to_string();
        tokio::spawn(async move {
            let exited = CancellationToken::new();
            let stdin_closed = CancellationToken::new();
            let serving = tokio::spawn(serve(
                attachment,
                script.output.clone(),
                script.echo_stdin,
                script.hold,
                tty,
                exited.clone(),
                stdin_closed.clone(),
            ));

            if script.hold {
                // Runs as long as the container does.
                if let Some(run) = container_run {
                    run.exited.cancelled().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } else if script.echo_stdin && attach_stdin {
                stdin_closed.cancelled().await;
            } else {
                tokio::time::sleep(script.run_time).await;
            }

            // Record the exit code before the stream closes.
            end_exec(&state, &exec_id, script.exit_code);
            exited.cancel();
            let _ = serving.await;
        });

        Ok(HijackedStream::new(client_in, client_out, tty))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, EngineError> {
        self.record(Call::InspectExec(exec_id.to_string()));
        let state = self.lock();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| EngineError::NotFound(exec_id.to_string()))?;
        if exec.inspect_fail {
            return Err(EngineError::Api {
                status: 500,
                message: format!("cannot inspect exec {exec_id}"),
            });
        }
        Ok(ExecInspect {
            id: exec_id.to_string(),
            running: exec.running,
            exit_code: exec.exit_code,
        })
    }

    async fn resize_exec(&self, exec_id: &str, size: TerminalSize) -> Result<(), EngineError> {
        self.record(Call::ResizeExec(exec_id.to_string(), size));
        Ok(())
    }

    async fn stats_once(&self, id: &str) -> Result<StatsSample, EngineError> {
        self.record(Call::Stats(id.to_string()));
        let state = self.lock();
        let c = state.find(id)?;
        if c.stats_fail {
            return Err(EngineError::Api {
                status: 500,
                message: format!("stats unavailable for {id}"),
            });
        }
        Ok(sample_for(c, 0))
    }

    async fn stats_stream(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError> {
        self.record(Call::StatsStream(id.to_string()));
        let samples = {
            let state = self.lock();
            let c = state.find(id)?;
            if c.stats_fail {
                return Err(EngineError::Api {
                    status: 500,
                    message: format!("stats unavailable for {id}"),
                });
            }
            let count = c.stats.len().max(1);
            (0..count).map(|i| sample_for(c, i)).collect::<Vec<_>>()
        };

        let guard = StreamGuard::open(&self.open_streams);
        let interval = self.stats_interval;
        let stream = stream::unfold((guard, samples, 0usize), move |(guard, samples, i)| async move {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            let sample = samples[i % samples.len()].clone();
            Some((Ok(sample), (guard, samples, i + 1)))
        });
        Ok(stream.boxed())
    }

    async fn top(&self, id: &str, _ps_args: Option<&str>) -> Result<TopResponse, EngineError> {
        self.record(Call::Top(id.to_string()));
        let state = self.lock();
        let c = state.find(id)?;
        if c.state != ContainerState::Running {
            return Err(conflict(format!("Container {id} is not running")));
        }
        Ok(TopResponse {
            titles: vec!["PID".into(), "USER".into(), "COMMAND".into()],
            processes: vec![vec!["1".into(), "root".into(), "sh".into()]],
        })
    }

    async fn logs(
        &self,
        id: &str,
        _options: &LogsOptions,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError> {
        self.record(Call::Logs(id.to_string()));
        let logs = self.lock().find(id)?.logs.clone();
        Ok(stream::iter(vec![Ok(Bytes::from(logs))]).boxed())
    }

    async fn stat_container_path(&self, id: &str, path: &str) -> Result<PathStat, EngineError> {
        self.record(Call::StatPath(id.to_string(), path.to_string()));
        let host = self.fs_path(id, path)?;
        let meta = std::fs::symlink_metadata(&host)
            .map_err(|_| EngineError::PathNotFound(path.to_string()))?;
        let link_target = if meta.file_type().is_symlink() {
            std::fs::read_link(&host)
                .map_err(EngineError::Io)?
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };
        Ok(PathStat {
            name: archive_name(path),
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            mode: mode_bits(&meta),
            link_target,
        })
    }

    async fn copy_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<(PathStat, ArchiveReader), EngineError> {
        self.record(Call::CopyFrom(id.to_string(), path.to_string()));
        let host = self.fs_path(id, path)?;
        let meta = std::fs::symlink_metadata(&host)
            .map_err(|_| EngineError::PathNotFound(path.to_string()))?;
        let name = archive_name(path);

        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        if meta.is_dir() {
            builder.append_dir_all(&name, &host).map_err(EngineError::Io)?;
        } else {
            builder
                .append_path_with_name(&host, &name)
                .map_err(EngineError::Io)?;
        }
        let bytes = builder.into_inner().map_err(EngineError::Io)?;

        let stat = PathStat {
            name,
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            mode: mode_bits(&meta),
            link_target: String::new(),
        };
        Ok((stat, Box::pin(io::Cursor::new(bytes))))
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        mut archive: ArchiveReader,
        _options: CopyToOptions,
    ) -> Result<(), EngineError> {
        self.record(Call::CopyTo(id.to_string(), path.to_string()));
        let host = self.fs_path(id, path)?;
        let mut bytes = Vec::new();
        archive.read_to_end(&mut bytes).await.map_err(EngineError::Io)?;
        if !host.is_dir() {
            return Err(EngineError::PathNotFound(path.to_string()));
        }
        tar::Archive::new(&bytes[..])
            .unpack(&host)
            .map_err(|e| EngineError::Api {
                status: 400,
                message: format!("bad archive: {e}"),
            })
    }

    async fn list_images(&self, labels: &LabelFilters) -> Result<Vec<ImageSummary>, EngineError> {
        self.record(Call::ListImages);
        Ok(self
            .lock()
            .images
            .iter()
            .filter(|img| {
                let empty = HashMap::new();
                let image_labels = img.labels.as_ref().unwrap_or(&empty);
                labels.iter().all(|f| label_matches(image_labels, f))
            })
            .cloned()
            .collect())
    }

    async fn remove_image(
        &self,
        name: &str,
        _force: bool,
    ) -> Result<Vec<ImageDeleteItem>, EngineError> {
        self.record(Call::RemoveImage(name.to_string()));
        let mut state = self.lock();
        let before = state.images.len();
        state.images.retain(|img| {
            img.id != name && !img.repo_tags.as_ref().is_some_and(|t| t.iter().any(|t| t == name))
        });
        if state.images.len() == before {
            return Err(EngineError::Api {
                status: 404,
                message: format!("No such image: {name}"),
            });
        }
        Ok(vec![ImageDeleteItem {
            untagged: Some(name.to_string()),
            deleted: None,
        }])
    }
}

impl FakeEngine {
    fn begin_exec(&self, exec_id: &str) -> Result<(Script, Option<Run>), EngineError> {
        let mut state = self.lock();
        let container = {
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| EngineError::NotFound(exec_id.to_string()))?;
            exec.running = true;
            exec.container.clone()
        };
        let run = state.find(&container).ok().and_then(|c| c.run.clone());
        let script = state
            .execs
            .get(exec_id)
            .map(|e| e.script.clone())
            .unwrap_or_default();
        Ok((script, run))
    }
}

fn end_exec(state: &Mutex<State>, exec_id: &str, code: i64) {
    if let Some(exec) = lock(state).execs.get_mut(exec_id) {
        exec.running = false;
        exec.exit_code = Some(code);
    }
}

fn sample_for(c: &FakeContainer, i: usize) -> StatsSample {
    let mut sample = c
        .stats
        .get(i % c.stats.len().max(1))
        .cloned()
        .unwrap_or_default();
    if sample.id.is_empty() {
        sample.id.clone_from(&c.id);
    }
    if sample.name.is_empty() {
        sample.name = format!("/{}", c.name);
    }
    sample
}

fn label_matches(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

// -----------------------------------------------------------------------
// Terminal and output fakes
// -----------------------------------------------------------------------

struct FakeTerminalState {
    tty: bool,
    raw: AtomicBool,
    restores: AtomicUsize,
    size: Mutex<Option<TerminalSize>>,
}

/// Scriptable terminal backend. Clones share state.
#[derive(Clone)]
pub struct FakeTerminal {
    state: Arc<FakeTerminalState>,
}

impl FakeTerminal {
    /// A terminal of the given size.
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            state: Arc::new(FakeTerminalState {
                tty: true,
                raw: AtomicBool::new(false),
                restores: AtomicUsize::new(0),
                size: Mutex::new(Some(TerminalSize::new(cols, rows))),
            }),
        }
    }

    /// Redirected input: not a terminal, no size.
    #[must_use]
    pub fn not_a_tty() -> Self {
        Self {
            state: Arc::new(FakeTerminalState {
                tty: false,
                raw: AtomicBool::new(false),
                restores: AtomicUsize::new(0),
                size: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn is_raw(&self) -> bool {
        self.state.raw.load(Ordering::SeqCst)
    }

    /// Number of times a saved mode was restored.
    #[must_use]
    pub fn restore_count(&self) -> usize {
        self.state.restores.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, size: TerminalSize) {
        *self.state.size.lock().unwrap_or_else(PoisonError::into_inner) = Some(size);
    }
}

impl TerminalBackend for FakeTerminal {
    fn is_tty(&self) -> bool {
        self.state.tty
    }

    fn make_raw(&self) -> Result<(), TerminalError> {
        if !self.state.tty {
            return Err(TerminalError::NotATty);
        }
        self.state.raw.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> Result<(), TerminalError> {
        if self.state.raw.swap(false, Ordering::SeqCst) {
            self.state.restores.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn size(&self) -> Result<TerminalSize, TerminalError> {
        self.state
            .size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(TerminalError::NotATty)
    }
}

/// Clonable in-memory writer for capturing output.
#[derive(Clone, Default)]
pub struct SharedBuf {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Stdin that never produces data and never ends.
pub struct PendingInput;

impl AsyncRead for PendingInput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_ids_are_hex_and_distinct() {
        let a = fake_id(0);
        let b = fake_id(1);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(&a[..12], &b[..12]);
    }

    #[tokio::test]
    async fn test_wait_not_running_on_created_container_returns_immediately() {
        let engine = FakeEngine::new();
        let c = engine.add_container(ContainerSpec::new("web"));
        let handle = engine
            .wait_container(&c.id, WaitCondition::NotRunning)
            .await
            .unwrap();
        assert_eq!(handle.status().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_exit_resolves_after_start() {
        let engine = FakeEngine::new();
        let c = engine.add_container(ContainerSpec::new("job").script(Script::exits(3)));
        let handle = engine
            .wait_container(&c.id, WaitCondition::NextExit)
            .await
            .unwrap();
        engine.start_container(&c.id).await.unwrap();
        assert_eq!(handle.status().await.unwrap(), 3);
        assert_eq!(engine.container("job").unwrap().state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_stats_stream_tracks_open_streams() {
        let engine = FakeEngine::new();
        engine.add_container(ContainerSpec::new("web").running(true).script(Script::held()));
        let mut s = engine.stats_stream("web").await.unwrap();
        assert!(s.next().await.is_some());
        assert_eq!(engine.open_stats_streams(), 1);
        drop(s);
        assert_eq!(engine.open_stats_streams(), 0);
    }

    #[tokio::test]
    async fn test_shared_buf_collects_writes() {
        let mut buf = SharedBuf::new();
        buf.write_all(b"hello ").await.unwrap();
        buf.write_all(b"world").await.unwrap();
        assert_eq!(buf.text(), "hello world");
    }
}
