//! Session engine tests against the in-process fake engine.

use agentbox::engine::frame::StreamKind;
use agentbox::engine::{ContainerRef, Engine, TerminalSize, WaitCondition};
use agentbox::session::detach::DetachKeys;
use agentbox::session::{
    run_container_session, run_exec_session, thread_reader, ExecRequest, SessionError, SessionIo,
    SessionOptions, SessionOutcome,
};
use agentbox::terminal::Terminal;
use agentbox::testing::{Call, ContainerSpec, FakeEngine, FakeTerminal, PendingInput, Script, SharedBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const LIMIT: Duration = Duration::from_secs(5);

struct Captured {
    stdout: SharedBuf,
    stderr: SharedBuf,
}

fn capture() -> (SessionIo, Captured) {
    capture_with(Box::new(PendingInput))
}

fn capture_with(stdin: Box<dyn tokio::io::AsyncRead + Send + Unpin>) -> (SessionIo, Captured) {
    let stdout = SharedBuf::new();
    let stderr = SharedBuf::new();
    let io = SessionIo {
        stdin,
        stdout: Box::new(stdout.clone()),
        stderr: Box::new(stderr.clone()),
    };
    (io, Captured { stdout, stderr })
}

fn new_session(tty: bool, stdin_open: bool) -> SessionOptions {
    SessionOptions {
        tty,
        stdin_open,
        start: true,
        ..SessionOptions::default()
    }
}

async fn run_session(
    engine: &FakeEngine,
    terminal: &Terminal,
    container: &ContainerRef,
    options: &SessionOptions,
    io: SessionIo,
) -> Result<SessionOutcome, SessionError> {
    let cancel = CancellationToken::new();
    timeout(
        LIMIT,
        run_container_session(engine, terminal, container, options, io, &cancel),
    )
    .await
    .expect("session timed out")
}

#[tokio::test]
async fn test_attach_happens_before_start() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let web = engine.add_container(
        ContainerSpec::new("web")
            .tty(true)
            .script(Script::exits(0).prints(StreamKind::Stdout, "hi\n")),
    );

    let (io, out) = capture();
    let outcome = run_session(&engine, &terminal, &web, &new_session(true, true), io)
        .await
        .unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(0));
    assert_eq!(out.stdout.text(), "hi\n");
    assert!(engine.called_before(&Call::Attach(web.id.clone()), &Call::Start(web.id.clone())));
    assert!(engine.called_before(
        &Call::Wait(web.id.clone(), WaitCondition::NextExit),
        &Call::Start(web.id.clone())
    ));
    assert!(!fake.is_raw());
    assert_eq!(fake.restore_count(), 1);
}

#[tokio::test]
async fn test_auto_remove_waits_for_removal() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let job = engine.add_container(ContainerSpec::new("job").auto_remove(true).script(Script::exits(1)));

    let options = SessionOptions {
        auto_remove: true,
        ..new_session(false, false)
    };
    let (io, out) = capture();
    let outcome = run_session(&engine, &terminal, &job, &options, io).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(1));
    assert_eq!(outcome.failure_code(), Some(1));
    assert!(engine.calls().contains(&Call::Wait(job.id.clone(), WaitCondition::Removed)));
    assert!(!engine.exists("job"));
    assert!(out.stdout.contents().is_empty());
    assert!(out.stderr.contents().is_empty());
}

#[tokio::test]
async fn test_session_never_waits_for_not_running_before_start() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let job = engine.add_container(ContainerSpec::new("job").script(Script::exits(0)));

    let (io, _out) = capture();
    run_session(&engine, &terminal, &job, &new_session(false, false), io)
        .await
        .unwrap();

    let waits: Vec<WaitCondition> = engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Wait(_, condition) => Some(condition),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![WaitCondition::NextExit]);
}

#[tokio::test]
async fn test_non_tty_output_is_demultiplexed() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let job = engine.add_container(
        ContainerSpec::new("job").script(
            Script::exits(0)
                .prints(StreamKind::Stdout, "out1 ")
                .prints(StreamKind::Stderr, "err1 ")
                .prints(StreamKind::Stdout, "out2")
                .prints(StreamKind::Stderr, "err2"),
        ),
    );

    let (io, out) = capture();
    run_session(&engine, &terminal, &job, &new_session(false, false), io)
        .await
        .unwrap();

    assert_eq!(out.stdout.text(), "out1 out2");
    assert_eq!(out.stderr.text(), "err1 err2");
}

#[tokio::test]
async fn test_exit_code_propagates_and_terminal_is_restored() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let job = engine.add_container(ContainerSpec::new("job").tty(true).script(Script::exits(42)));

    let (io, _out) = capture();
    let outcome = run_session(&engine, &terminal, &job, &new_session(true, true), io)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code(), Some(42));
    assert!(!fake.is_raw());
    assert_eq!(fake.restore_count(), 1);
}

#[tokio::test]
async fn test_initial_resize_is_one_larger_then_exact() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::new(80, 24));
    let job = engine.add_container(ContainerSpec::new("job").tty(true).script(Script::exits(0)));

    let (io, _out) = capture();
    run_session(&engine, &terminal, &job, &new_session(true, true), io)
        .await
        .unwrap();

    let resizes: Vec<TerminalSize> = engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Resize(_, size) => Some(size),
            _ => None,
        })
        .collect();
    assert_eq!(resizes, vec![TerminalSize::new(81, 25), TerminalSize::new(80, 24)]);
    assert!(engine.called_before(
        &Call::Start(job.id.clone()),
        &Call::Resize(job.id.clone(), TerminalSize::new(81, 25))
    ));
}

#[tokio::test]
async fn test_resize_events_are_forwarded() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let shell = engine.add_container(ContainerSpec::new("shell").tty(true).script(Script::held()));

    let session = {
        let engine = engine.clone();
        let terminal = terminal.clone();
        let shell = shell.clone();
        tokio::spawn(async move {
            let (io, _out) = capture();
            let cancel = CancellationToken::new();
            run_container_session(&engine, &terminal, &shell, &new_session(true, true), io, &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(terminal.subscriber_count(), 1);
    let size = TerminalSize::new(120, 40);
    fake.set_size(size);
    terminal.notify_resize(size);
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.stop_container(&shell.id, None).await.unwrap();
    let outcome = timeout(LIMIT, session).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Exited(0));

    let forwarded = engine
        .calls()
        .into_iter()
        .filter(|c| *c == Call::Resize(shell.id.clone(), size))
        .count();
    assert_eq!(forwarded, 1);
    assert_eq!(terminal.subscriber_count(), 0);
    assert!(!fake.is_raw());
}

#[tokio::test]
async fn test_stream_close_without_exit_detaches_after_grace() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let daemon = engine.add_container(ContainerSpec::new("daemon").running(true).script(Script::held()));

    // Stdin EOF makes the engine drop the stream while the process runs on.
    let options = SessionOptions {
        start: false,
        detach_grace: Duration::from_millis(100),
        ..new_session(false, true)
    };
    let (io, _out) = capture_with(Box::new(tokio::io::empty()));
    let outcome = run_session(&engine, &terminal, &daemon, &options, io).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Detached);
    assert!(engine.container("daemon").unwrap().is_running());
}

#[tokio::test]
async fn test_exit_within_grace_window_wins() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let daemon = engine.add_container(
        ContainerSpec::new("daemon")
            .running(true)
            .script(Script {
                exit_code: 7,
                ..Script::held()
            }),
    );

    let stopper = {
        let engine = engine.clone();
        let id = daemon.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.stop_container(&id, None).await
        })
    };

    let options = SessionOptions {
        start: false,
        ..new_session(false, true)
    };
    let (io, _out) = capture_with(Box::new(tokio::io::empty()));
    let outcome = run_session(&engine, &terminal, &daemon, &options, io).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(7));
    stopper.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_detach_sequence_ends_session() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let shell = engine.add_container(
        ContainerSpec::new("shell")
            .tty(true)
            .open_stdin(true)
            .running(true)
            .script(Script::held().greets("$ ")),
    );

    let (mut keyboard, stdin) = tokio::io::duplex(64);
    keyboard.write_all(b"ls\x10\x11").await.unwrap();

    let options = SessionOptions {
        start: false,
        detach_keys: Some(DetachKeys::default()),
        detach_grace: Duration::from_millis(200),
        ..new_session(true, true)
    };
    let (io, out) = capture_with(Box::new(stdin));
    let outcome = run_session(&engine, &terminal, &shell, &options, io).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Detached);
    assert!(out.stdout.text().starts_with("$ "));
    assert!(engine.container("shell").unwrap().is_running());
    assert!(!fake.is_raw());
    assert_eq!(fake.restore_count(), 1);
    drop(keyboard);
}

#[tokio::test]
async fn test_cancellation_interrupts_and_restores() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let shell = engine.add_container(ContainerSpec::new("shell").tty(true).script(Script::held()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let (io, _out) = capture();
    let result = timeout(
        LIMIT,
        run_container_session(&engine, &terminal, &shell, &new_session(true, true), io, &cancel),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(SessionError::Interrupted)));
    assert!(!fake.is_raw());
    assert_eq!(fake.restore_count(), 1);
    assert_eq!(terminal.subscriber_count(), 0);
}

#[tokio::test]
async fn test_engine_error_during_attach_leaves_terminal_alone() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let ghost = ContainerRef {
        id: "does-not-exist".to_string(),
        name: "ghost".to_string(),
        state: agentbox::engine::ContainerState::Created,
        tty: true,
    };

    let (io, _out) = capture();
    let result = run_session(&engine, &terminal, &ghost, &new_session(true, true), io).await;

    assert!(matches!(result, Err(SessionError::Engine { .. })));
    assert!(!fake.is_raw());
    assert!(terminal.setup().is_ok());
}

#[tokio::test]
async fn test_engine_error_during_start_restores_terminal() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let broken = engine.add_container(
        ContainerSpec::new("broken")
            .tty(true)
            .failing_start()
            .script(Script::held()),
    );

    let (io, _out) = capture();
    let result = run_session(&engine, &terminal, &broken, &new_session(true, true), io).await;

    assert!(matches!(result, Err(SessionError::Engine { .. })));
    assert!(!fake.is_raw());
    assert_eq!(fake.restore_count(), 1);
    assert!(!engine.calls().iter().any(|c| matches!(c, Call::Resize(..))));
    assert_eq!(terminal.subscriber_count(), 0);
}

#[test]
fn test_runtime_shutdown_does_not_wait_for_blocked_stdin() {
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let outcome = rt.block_on(async {
        let engine = FakeEngine::new();
        let terminal = Terminal::new(FakeTerminal::not_a_tty());
        let job = engine.add_container(ContainerSpec::new("job").script(Script::exits(0)));
        let (io, _out) = capture_with(thread_reader(std::fs::File::from(read_end)));
        run_session(&engine, &terminal, &job, &new_session(false, true), io)
            .await
            .unwrap()
    });
    assert_eq!(outcome, SessionOutcome::Exited(0));

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        drop(rt);
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "runtime shutdown blocked on stdin"
    );
    drop(write_end);
}

#[tokio::test]
async fn test_nested_session_is_busy() {
    let engine = FakeEngine::new();
    let fake = FakeTerminal::new(80, 24);
    let terminal = Terminal::new(fake.clone());
    let job = engine.add_container(ContainerSpec::new("job").tty(true).script(Script::exits(0)));

    let outer = terminal.setup().unwrap();
    let (io, _out) = capture();
    let result = run_session(&engine, &terminal, &job, &new_session(true, true), io).await;

    assert!(matches!(
        result,
        Err(SessionError::Terminal(agentbox::terminal::TerminalError::Busy))
    ));
    assert!(outer.is_active());
    assert!(fake.is_raw());
}

#[tokio::test]
async fn test_exec_detached_prints_id_without_attaching() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let web = engine.add_container(ContainerSpec::new("web").running(true).script(Script::held()));

    let request = ExecRequest {
        cmd: vec!["sleep".to_string(), "100".to_string()],
        detach: true,
        ..ExecRequest::default()
    };
    let (io, out) = capture();
    let cancel = CancellationToken::new();
    let outcome = run_exec_session(
        &engine,
        &terminal,
        &web,
        &request,
        &SessionOptions::default(),
        io,
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(outcome.failure_code(), None);
    let printed = out.stdout.text();
    let exec_id = printed.trim_end();
    assert!(exec_id.len() >= 8);
    assert!(exec_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(engine.calls().contains(&Call::StartExec(exec_id.to_string())));
    assert!(!engine.calls().iter().any(|c| matches!(c, Call::AttachExec(_))));
}

#[tokio::test]
async fn test_exec_reports_process_exit_code() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let web = engine.add_container(
        ContainerSpec::new("web")
            .running(true)
            .script(Script::held())
            .exec_script(Script::exits(5).prints(StreamKind::Stderr, "boom")),
    );

    let request = ExecRequest {
        cmd: vec!["false".to_string()],
        ..ExecRequest::default()
    };
    let (io, out) = capture();
    let cancel = CancellationToken::new();
    let outcome = timeout(
        LIMIT,
        run_exec_session(&engine, &terminal, &web, &request, &SessionOptions::default(), io, &cancel),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(5));
    assert_eq!(out.stderr.text(), "boom");
    assert_eq!(engine.exec_configs()[0].cmd, vec!["false"]);
}

#[tokio::test]
async fn test_exec_inspect_failure_counts_as_success() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let web = engine.add_container(
        ContainerSpec::new("web")
            .running(true)
            .script(Script::held())
            .failing_exec_inspect()
            .exec_script(Script::exits(7).prints(StreamKind::Stdout, "done\n")),
    );

    let request = ExecRequest {
        cmd: vec!["make".to_string()],
        ..ExecRequest::default()
    };
    let (io, out) = capture();
    let cancel = CancellationToken::new();
    let outcome = timeout(
        LIMIT,
        run_exec_session(&engine, &terminal, &web, &request, &SessionOptions::default(), io, &cancel),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(0));
    assert_eq!(out.stdout.text(), "done\n");
    assert!(engine.calls().iter().any(|c| matches!(c, Call::InspectExec(_))));
}

#[tokio::test]
async fn test_exec_requires_running_container() {
    let engine = FakeEngine::new();
    let terminal = Terminal::new(FakeTerminal::not_a_tty());
    let stopped = engine.add_container(ContainerSpec::new("stopped"));

    let (io, _out) = capture();
    let cancel = CancellationToken::new();
    let result = run_exec_session(
        &engine,
        &terminal,
        &stopped,
        &ExecRequest {
            cmd: vec!["sh".to_string()],
            ..ExecRequest::default()
        },
        &SessionOptions::default(),
        io,
        &cancel,
    )
    .await;

    assert!(matches!(result, Err(SessionError::ContainerNotRunning(name)) if name == "stopped"));
    assert!(!engine.calls().iter().any(|c| matches!(c, Call::CreateExec(..))));
}
