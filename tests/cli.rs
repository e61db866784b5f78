//! End-to-end CLI tests using assert_cmd.
//!
//! These run the agentbox binary against an engine socket that does not
//! exist, so they cover everything that happens before the first engine
//! call plus the unreachable-engine path.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const MISSING_SOCKET: &str = "/nonexistent/agentbox-test.sock";

/// Isolated config and project directories for one invocation.
struct TestEnv {
    home: TempDir,
    project: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            project: TempDir::new().unwrap(),
        }
    }

    fn agentbox(&self) -> Command {
        let mut cmd = Command::cargo_bin("agentbox").unwrap();
        cmd.env("HOME", self.home.path())
            .env("XDG_CONFIG_HOME", self.home.path().join(".config"))
            .env_remove("DOCKER_HOST")
            .env_remove("AGENTBOX_HOST")
            .env_remove("RUST_LOG")
            .arg("--workdir")
            .arg(self.project.path())
            .arg("--host")
            .arg(MISSING_SOCKET);
        cmd
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&strip_ansi_escapes::strip(&output.stderr)).into_owned()
}

#[test]
fn test_help() {
    Command::cargo_bin("agentbox")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("cp"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("rmi"));
}

#[test]
fn test_version() {
    Command::cargo_bin("agentbox")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_container_group_help() {
    Command::cargo_bin("agentbox")
        .unwrap()
        .args(["container", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("attach"));
}

#[test]
fn test_cp_requires_a_container_side() {
    let env = TestEnv::new();
    let output = env.agentbox().args(["cp", "a.txt", "b.txt"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("one of source or destination must be a container path"));
}

#[test]
fn test_cp_between_containers_is_refused() {
    let env = TestEnv::new();
    let output = env.agentbox().args(["cp", "web:/a", "db:/b"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("copying between containers is not supported"));
}

#[test]
fn test_rm_conflicts_with_restart_policy() {
    let env = TestEnv::new();
    let output = env
        .agentbox()
        .args(["run", "--rm", "--restart", "always", "alpine"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr_text(&output);
    assert!(stderr.contains("conflicting options"), "stderr: {stderr}");
    assert!(!stderr.contains("connecting to engine"));
}

#[test]
fn test_memory_swap_requires_memory() {
    let env = TestEnv::new();
    let output = env
        .agentbox()
        .args(["create", "--memory-swap", "1g", "alpine"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("--memory-swap requires --memory"));
}

#[test]
fn test_invalid_detach_keys() {
    let env = TestEnv::new();
    let output = env
        .agentbox()
        .args(["run", "-it", "--detach-keys", "ctrl-1", "alpine"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("invalid detach keys"));
}

#[test]
fn test_invalid_memory_size_is_a_usage_error() {
    let env = TestEnv::new();
    env.agentbox()
        .args(["run", "--memory", "lots", "alpine"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_unreachable_engine() {
    let env = TestEnv::new();
    let output = env.agentbox().arg("ps").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr_text(&output);
    assert!(stderr.contains("connecting to engine"), "stderr: {stderr}");
    assert!(stderr.contains(MISSING_SOCKET));
}

#[test]
fn test_unreachable_engine_under_container_group() {
    let env = TestEnv::new();
    env.agentbox()
        .args(["container", "stop", "web"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("connecting to engine"));
}
