//! Host terminal control.
//!
//! Raw mode, terminal size, and resize notifications for interactive
//! sessions. Raw mode is process-wide state: only one session may hold it at
//! a time, and it is restored when the [`RawModeGuard`] is dropped, including
//! during unwinding.

#![allow(unsafe_code)] // TIOCGWINSZ ioctl

use crate::engine::TerminalSize;
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios};
use std::future::Future;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors from terminal operations.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("not a terminal")]
    NotATty,

    #[error("terminal is already in use by another interactive session")]
    Busy,

    #[error("failed to watch for terminal resizes: {0}")]
    Signal(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Low-level terminal operations.
pub trait TerminalBackend: Send + Sync {
    /// Whether the input side is a terminal.
    fn is_tty(&self) -> bool;

    /// Save the current mode and switch to raw mode.
    fn make_raw(&self) -> Result<(), TerminalError>;

    /// Restore the mode saved by `make_raw`. No-op if nothing was saved.
    fn restore(&self) -> Result<(), TerminalError>;

    fn size(&self) -> Result<TerminalSize, TerminalError>;
}

/// Backend for the process's stdin/stdout.
pub struct StdioBackend {
    input: OwnedFd,
    output: OwnedFd,
    saved: Mutex<Option<Termios>>,
}

impl StdioBackend {
    /// Duplicate the stdin and stdout descriptors.
    pub fn stdio() -> Result<Self, TerminalError> {
        let input = std::io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(TerminalError::Io)?;
        let output = std::io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map_err(TerminalError::Io)?;
        Ok(Self::from_fds(input, output))
    }

    /// Use explicit descriptors (e.g. a pty pair).
    #[must_use]
    pub const fn from_fds(input: OwnedFd, output: OwnedFd) -> Self {
        Self {
            input,
            output,
            saved: Mutex::new(None),
        }
    }

    fn raw_attributes(original: &Termios) -> Termios {
        let mut raw = original.clone();

        // Input flags: disable special handling
        raw.input_flags.remove(InputFlags::IGNBRK);
        raw.input_flags.remove(InputFlags::BRKINT);
        raw.input_flags.remove(InputFlags::PARMRK);
        raw.input_flags.remove(InputFlags::ISTRIP);
        raw.input_flags.remove(InputFlags::INLCR);
        raw.input_flags.remove(InputFlags::IGNCR);
        raw.input_flags.remove(InputFlags::ICRNL);
        raw.input_flags.remove(InputFlags::IXON);

        // Output flags: the container's terminal does its own post-processing
        raw.output_flags.remove(OutputFlags::OPOST);

        // Local flags: no echo, no line buffering; ^C/^Z reach the container as bytes
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ECHONL);
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);

        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        raw
    }

    fn winsize(fd: &impl AsRawFd) -> Option<TerminalSize> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if result == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
            Some(TerminalSize::new(ws.ws_col, ws.ws_row))
        } else {
            None
        }
    }
}

impl TerminalBackend for StdioBackend {
    fn is_tty(&self) -> bool {
        nix::unistd::isatty(&self.input).unwrap_or(false)
    }

    fn make_raw(&self) -> Result<(), TerminalError> {
        if !self.is_tty() {
            return Err(TerminalError::NotATty);
        }
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let original = termios::tcgetattr(&self.input).map_err(TerminalError::GetTermios)?;
        let raw = Self::raw_attributes(&original);
        termios::tcsetattr(&self.input, SetArg::TCSAFLUSH, &raw)
            .map_err(TerminalError::SetTermios)?;
        // Keep the first saved state if make_raw is called twice.
        if saved.is_none() {
            *saved = Some(original);
        }
        Ok(())
    }

    fn restore(&self) -> Result<(), TerminalError> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(original) = saved.take() {
            termios::tcsetattr(&self.input, SetArg::TCSAFLUSH, &original)
                .map_err(TerminalError::SetTermios)?;
        }
        Ok(())
    }

    fn size(&self) -> Result<TerminalSize, TerminalError> {
        Self::winsize(&self.output)
            .or_else(|| Self::winsize(&self.input))
            .ok_or(TerminalError::NotATty)
    }
}

struct Inner {
    backend: Box<dyn TerminalBackend>,
    raw_held: AtomicBool,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<TerminalSize>)>>,
    next_id: AtomicU64,
}

/// The terminal controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<Inner>,
}

static STDIO_TERMINAL: OnceLock<Terminal> = OnceLock::new();

impl Terminal {
    /// Wrap a backend in a new controller.
    pub fn new(backend: impl TerminalBackend + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Box::new(backend),
                raw_held: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide controller for stdin/stdout.
    pub fn stdio() -> Result<Self, TerminalError> {
        if let Some(terminal) = STDIO_TERMINAL.get() {
            return Ok(terminal.clone());
        }
        let terminal = Self::new(StdioBackend::stdio()?);
        Ok(STDIO_TERMINAL.get_or_init(|| terminal).clone())
    }

    #[must_use]
    pub fn is_tty(&self) -> bool {
        self.inner.backend.is_tty()
    }

    /// Enter raw mode.
    ///
    /// Returns an inactive guard when the input is not a terminal. Fails
    /// with [`TerminalError::Busy`] while another guard is active.
    pub fn setup(&self) -> Result<RawModeGuard, TerminalError> {
        if !self.is_tty() {
            debug!("stdin is not a terminal, leaving mode unchanged");
            return Ok(RawModeGuard {
                terminal: self.clone(),
                active: false,
            });
        }

        if self
            .inner
            .raw_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TerminalError::Busy);
        }

        if let Err(e) = self.inner.backend.make_raw() {
            // Partial setup: put back whatever was saved before failing.
            let _ = self.inner.backend.restore();
            self.inner.raw_held.store(false, Ordering::Release);
            return Err(e);
        }

        debug!("entered raw mode");
        Ok(RawModeGuard {
            terminal: self.clone(),
            active: true,
        })
    }

    /// Current terminal size.
    pub fn size(&self) -> Result<TerminalSize, TerminalError> {
        self.inner.backend.size()
    }

    /// Subscribe to terminal size changes. Dropping the subscription releases it.
    #[must_use]
    pub fn on_resize(&self) -> ResizeSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers().push((id, tx));
        ResizeSubscription {
            id,
            terminal: self.clone(),
            rx,
        }
    }

    /// Deliver a size change to every subscriber.
    pub fn notify_resize(&self, size: TerminalSize) {
        self.subscribers().retain(|(_, tx)| tx.send(size).is_ok());
    }

    /// Number of live resize subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Forward SIGWINCH to subscribers until the returned watch is dropped.
    pub fn watch_resize_signals(&self) -> Result<SignalWatch, TerminalError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigwinch = signal(SignalKind::window_change()).map_err(TerminalError::Signal)?;
        let terminal = self.clone();
        let handle = tokio::spawn(async move {
            while sigwinch.recv().await.is_some() {
                match terminal.size() {
                    Ok(size) => terminal.notify_resize(size),
                    Err(e) => debug!("ignoring SIGWINCH: {e}"),
                }
            }
        });
        Ok(SignalWatch { handle })
    }

    /// Apply the current size via `resize`, first one cell larger, then exact.
    ///
    /// The size change forces full-screen programs in the container to
    /// redraw after attaching. Does nothing when the size is unknown.
    pub async fn nudge<F, Fut, E>(&self, mut resize: F) -> Result<(), E>
    where
        F: FnMut(TerminalSize) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let Ok(size) = self.size() else {
            return Ok(());
        };
        resize(TerminalSize::new(
            size.cols.saturating_add(1),
            size.rows.saturating_add(1),
        ))
        .await?;
        resize(size).await
    }

    fn subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(u64, mpsc::UnboundedSender<TerminalSize>)>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release_raw(&self) {
        if let Err(e) = self.inner.backend.restore() {
            warn!("failed to restore terminal: {e}");
            eprintln!("Warning: failed to restore terminal: {e}");
        }
        self.inner.raw_held.store(false, Ordering::Release);
        debug!("restored terminal mode");
    }
}

/// Holds raw mode; restores the saved mode on drop.
pub struct RawModeGuard {
    terminal: Terminal,
    active: bool,
}

impl RawModeGuard {
    /// Whether this guard actually changed the terminal mode.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Restore the terminal now. Safe to call more than once.
    pub fn restore(&mut self) {
        if std::mem::take(&mut self.active) {
            self.terminal.release_raw();
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Receiver of terminal size changes.
pub struct ResizeSubscription {
    id: u64,
    terminal: Terminal,
    rx: mpsc::UnboundedReceiver<TerminalSize>,
}

impl ResizeSubscription {
    /// Next size change, or `None` once released.
    pub async fn recv(&mut self) -> Option<TerminalSize> {
        self.rx.recv().await
    }
}

impl Drop for ResizeSubscription {
    fn drop(&mut self) {
        let id = self.id;
        self.terminal.subscribers().retain(|(sub, _)| *sub != id);
    }
}

/// Running SIGWINCH forwarder; stops on drop.
pub struct SignalWatch {
    handle: JoinHandle<()>,
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTerminal;
    use nix::pty::openpty;

    #[test]
    fn test_setup_is_noop_without_tty() {
        let fake = FakeTerminal::not_a_tty();
        let terminal = Terminal::new(fake.clone());
        let guard = terminal.setup().unwrap();
        assert!(!guard.is_active());
        assert!(!fake.is_raw());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let fake = FakeTerminal::new(80, 24);
        let terminal = Terminal::new(fake.clone());
        {
            let guard = terminal.setup().unwrap();
            assert!(guard.is_active());
            assert!(fake.is_raw());
        }
        assert!(!fake.is_raw());
        assert_eq!(fake.restore_count(), 1);
    }

    #[test]
    fn test_nested_setup_is_busy() {
        let terminal = Terminal::new(FakeTerminal::new(80, 24));
        let _guard = terminal.setup().unwrap();
        assert!(matches!(terminal.setup(), Err(TerminalError::Busy)));
    }

    #[test]
    fn test_setup_available_again_after_restore() {
        let terminal = Terminal::new(FakeTerminal::new(80, 24));
        let mut guard = terminal.setup().unwrap();
        guard.restore();
        guard.restore();
        drop(guard);
        assert!(terminal.setup().is_ok());
    }

    #[test]
    fn test_restore_runs_on_panic() {
        let fake = FakeTerminal::new(80, 24);
        let terminal = Terminal::new(fake.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = terminal.setup().unwrap();
            panic!("session blew up");
        }));
        assert!(result.is_err());
        assert!(!fake.is_raw());
    }

    #[tokio::test]
    async fn test_resize_subscription_release() {
        let terminal = Terminal::new(FakeTerminal::new(80, 24));
        let mut sub = terminal.on_resize();
        assert_eq!(terminal.subscriber_count(), 1);

        terminal.notify_resize(TerminalSize::new(100, 40));
        assert_eq!(sub.recv().await, Some(TerminalSize::new(100, 40)));

        drop(sub);
        assert_eq!(terminal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_nudge_sends_plus_one_then_exact() {
        let terminal = Terminal::new(FakeTerminal::new(80, 24));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        terminal
            .nudge(|size| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(size);
                    Ok::<(), ()>(())
                }
            })
            .await
            .unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![TerminalSize::new(81, 25), TerminalSize::new(80, 24)]
        );
    }

    #[tokio::test]
    async fn test_nudge_skipped_without_size() {
        let terminal = Terminal::new(FakeTerminal::not_a_tty());
        let mut called = false;
        terminal
            .nudge(|_| {
                called = true;
                async { Ok::<(), ()>(()) }
            })
            .await
            .unwrap();
        assert!(!called);
    }

    #[test]
    fn test_stdio_backend_restores_exact_termios_on_pty() {
        let pty = openpty(None, None).unwrap();
        let before = termios::tcgetattr(&pty.slave).unwrap();

        let backend = StdioBackend::from_fds(
            pty.slave.try_clone().unwrap(),
            pty.slave.try_clone().unwrap(),
        );
        assert!(backend.is_tty());
        let terminal = Terminal::new(backend);

        let guard = terminal.setup().unwrap();
        let raw = termios::tcgetattr(&pty.slave).unwrap();
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        drop(guard);

        let after = termios::tcgetattr(&pty.slave).unwrap();
        assert_eq!(before.input_flags, after.input_flags);
        assert_eq!(before.output_flags, after.output_flags);
        assert_eq!(before.local_flags, after.local_flags);
        assert_eq!(before.control_flags, after.control_flags);
        assert_eq!(before.control_chars, after.control_chars);
    }
}
