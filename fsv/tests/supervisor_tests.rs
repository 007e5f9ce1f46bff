//! # Supervisor End-to-End Tests
//!
//! Runs the real `fsv` binary against a scratch state directory. The
//! supervisor waits for signals with `sigwait`, which only behaves in a
//! process it fully controls, so everything here goes through a child
//! process rather than the library API.
//!
//! - Crash loop with no backoff gives up
//! - Output routing to the log process
//! - Lock exclusion and status queries
//! - Termination on SIGTERM

use fsv_common::prelude::*;
use fsv_common::state_dir::effective_uid;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

const DEADLINE: Duration = Duration::from_secs(15);

fn fsv(state: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fsv"));
    cmd.arg("--state-dir").arg(state).env_remove("RUST_LOG");
    cmd
}

fn spawn(state: &Path, args: &[&str]) -> Child {
    fsv(state)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn fsv")
}

fn query(state: &Path, args: &[&str]) -> Output {
    fsv(state).args(args).output().expect("run fsv query")
}

fn snapshot_path(state: &Path, name: &str) -> PathBuf {
    state
        .join(format!("fsv-{}", effective_uid()))
        .join(name)
        .join("info.struct")
}

fn read_snapshot(state: &Path, name: &str) -> SnapshotRecord {
    SnapshotStore::read(&snapshot_path(state, name)).expect("read snapshot")
}

/// Poll `cond` until it holds or the deadline passes.
fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < DEADLINE, "timed out waiting for {what}");
        sleep(Duration::from_millis(20));
    }
}

fn wait_exit(child: &mut Child) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if start.elapsed() > DEADLINE {
            let _ = child.kill();
            panic!("fsv did not exit in time");
        }
        sleep(Duration::from_millis(20));
    }
}

/// Kills the supervisor if a test fails half way.
struct Running(Child);

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = kill(Pid::from_raw(self.0.id() as i32), Signal::SIGTERM);
            let _ = self.0.wait();
        }
    }
}

// ─── Crash loop ─────────────────────────────────────────────────────

#[test]
fn test_command_that_exits_immediately_gives_up() {
    let state = TempDir::new().unwrap();
    let mut child = spawn(state.path(), &["-n", "quick", "-m", "3", "--", "true"]);

    let status = wait_exit(&mut child);
    assert!(status.success(), "give-up should exit 0, got {status:?}");

    let rec = read_snapshot(state.path(), "quick");
    assert!(rec.supervisor.gave_up, "{rec:?}");
    assert_eq!(rec.supervisor.pid, 0);
    let cmd = rec.slot(SlotKind::Command);
    assert_eq!(cmd.pid, 0);
    assert_eq!(cmd.total_restarts, 4);
    assert_eq!(cmd.recent_restarts, 4);
    assert_eq!(cmd.last_exit_status, 0);
    assert!(rec.slot(SlotKind::Log).never_started());

    let out = query(state.path(), &["--status", "quick"]);
    assert_eq!(out.status.code(), Some(1));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("quick: gave up"), "{text}");
}

#[test]
fn test_crash_loop_backs_off_then_relaunches() {
    let state = TempDir::new().unwrap();
    let mut sup = Running(spawn(
        state.path(),
        &["-n", "backoff", "-m", "1", "-t", "2", "--", "true"],
    ));
    let total = |state: &Path| {
        SnapshotStore::read(&snapshot_path(state, "backoff"))
            .map(|rec| rec.slot(SlotKind::Command).total_restarts)
            .unwrap_or(0)
    };

    // Second rapid exit exceeds the limit of 1 and starts the 2 s backoff.
    wait_for("backoff to start", || total(state.path()) == 2);
    let entered = Instant::now();
    sleep(Duration::from_millis(1_000));
    assert_eq!(total(state.path()), 2, "relaunched during backoff");
    assert!(sup.0.try_wait().unwrap().is_none(), "supervisor exited during backoff");
    let rec = read_snapshot(state.path(), "backoff");
    assert!(!rec.supervisor.gave_up);
    assert_eq!(rec.slot(SlotKind::Command).pid, 0);

    // The timer fires, the command runs (and dies) again.
    wait_for("relaunch after backoff", || total(state.path()) >= 3);
    assert!(
        entered.elapsed() >= Duration::from_millis(900),
        "relaunch came too early: {:?}",
        entered.elapsed()
    );
    assert!(sup.0.try_wait().unwrap().is_none(), "supervisor gave up");

    kill(Pid::from_raw(sup.0.id() as i32), Signal::SIGTERM).unwrap();
    assert!(wait_exit(&mut sup.0).success());
    assert!(!read_snapshot(state.path(), "backoff").supervisor.gave_up);
}

// ─── Output routing, locking, termination ───────────────────────────

#[test]
fn test_stdout_only_routing_and_sigterm() {
    let state = TempDir::new().unwrap();
    let captured = state.path().join("captured.log");
    let log = format!("cat > '{}'", captured.display());
    let mut sup = Running(spawn(
        state.path(),
        &[
            "-n",
            "route",
            "-l",
            &log,
            "-o",
            "stdout",
            "--",
            "sh",
            "-c",
            "echo hello; echo oops >&2; exec sleep 30",
        ],
    ));

    wait_for("log output", || {
        std::fs::read_to_string(&captured).is_ok_and(|s| s == "hello\n")
    });
    wait_for("running snapshot", || {
        SnapshotStore::read(&snapshot_path(state.path(), "route")).is_ok_and(|rec| {
            rec.supervisor.pid > 0
                && rec.slot(SlotKind::Command).pid > 0
                && rec.slot(SlotKind::Log).pid > 0
        })
    });

    let out = query(state.path(), &["--pids", "route"]);
    assert_eq!(out.status.code(), Some(0));
    let pids = String::from_utf8_lossy(&out.stdout).into_owned();
    let lines: Vec<&str> = pids.lines().collect();
    assert_eq!(lines.len(), 3, "{pids}");
    assert!(lines.iter().all(|l| l.parse::<i32>().is_ok()), "{pids}");
    assert_eq!(lines[0], sup.0.id().to_string());

    // A second supervisor for the same name must not start.
    let mut second = spawn(state.path(), &["-n", "route", "--", "sleep", "30"]);
    assert_eq!(wait_exit(&mut second).code(), Some(1));

    kill(Pid::from_raw(sup.0.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_exit(&mut sup.0);
    assert!(status.success(), "SIGTERM should exit 0, got {status:?}");

    let rec = read_snapshot(state.path(), "route");
    assert_eq!(rec.supervisor.pid, 0);
    assert!(!rec.supervisor.gave_up);
    assert_eq!(rec.slot(SlotKind::Command).pid, 0);
    assert_eq!(rec.slot(SlotKind::Log).pid, 0);
    assert_eq!(rec.slot(SlotKind::Command).total_restarts, 0);

    let out = query(state.path(), &["--status", "route", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["state"], "stopped");

    assert_eq!(std::fs::read_to_string(&captured).unwrap(), "hello\n");
}

// ─── Usage and queries ──────────────────────────────────────────────

#[test]
fn test_usage_errors_exit_64() {
    let state = TempDir::new().unwrap();
    let out = query(state.path(), &[]);
    assert_eq!(out.status.code(), Some(64), "missing command");

    let out = query(state.path(), &["-o", "sideways", "--", "true"]);
    assert_eq!(out.status.code(), Some(64), "bad output mode");

    let out = query(state.path(), &["-o", "stdout", "--", "true"]);
    assert_eq!(out.status.code(), Some(64), "routing without a log command");

    let out = query(state.path(), &["-n", ".hidden", "--", "true"]);
    assert_eq!(out.status.code(), Some(64), "bad service name");
}

#[test]
fn test_status_of_unknown_service_fails() {
    let state = TempDir::new().unwrap();
    let out = query(state.path(), &["--status", "nothing-here"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}

#[test]
fn test_config_file_supplies_command() {
    let state = TempDir::new().unwrap();
    let config = state.path().join("svc.toml");
    std::fs::write(
        &config,
        "name = \"fromfile\"\ncommand = [\"true\"]\n\n[command_limits]\nmax_recent_restarts = 1\n",
    )
    .unwrap();

    let mut child = spawn(state.path(), &["-c", config.to_str().unwrap()]);
    assert!(wait_exit(&mut child).success());

    let rec = read_snapshot(state.path(), "fromfile");
    assert!(rec.supervisor.gave_up);
    assert_eq!(rec.slot(SlotKind::Command).total_restarts, 2);
    assert_eq!(rec.slot(SlotKind::Command).max_recent_restarts, 1);
}
