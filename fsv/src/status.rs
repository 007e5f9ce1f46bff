//! Status queries against a running (or finished) supervisor.
//!
//! Reads the status file and probes the lockfile of one service. A service
//! is reported as running only when the stored supervisor pid is nonzero
//! *and* somebody still holds the lock; a nonzero pid with a free lock means
//! the supervisor died without cleaning up.

use crate::error::FsvResult;
use crate::host::describe_wait_status;
use chrono::{DateTime, Local};
use fsv_common::clock::Timestamp;
use fsv_common::snapshot::{ChildSlot, SlotKind, SnapshotRecord, SupervisorState};
use fsv_common::state_dir::StateDir;
use fsv_common::store::SnapshotStore;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

/// Overall state of a service as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Supervisor pid recorded and lock held.
    Running,
    /// Supervisor exited cleanly (pid 0).
    Stopped,
    /// Pid recorded but nobody holds the lock.
    Stale,
}

/// Snapshot of one service plus the lock probe result.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub name: String,
    pub record: SnapshotRecord,
    pub lock_held: bool,
}

impl StatusReport {
    /// Load the state of service `name` owned by `uid` under `prefix`.
    pub fn load(prefix: &Path, uid: u32, name: &str) -> FsvResult<Self> {
        let dir = StateDir::open(prefix, uid, name)?;
        let record = SnapshotStore::read(&dir.snapshot_path())?;
        let lock_held = dir.probe_lock()?;
        Ok(Self {
            name: name.to_string(),
            record,
            lock_held,
        })
    }

    pub fn liveness(&self) -> Liveness {
        match (self.record.supervisor.pid, self.lock_held) {
            (0, _) => Liveness::Stopped,
            (_, true) => Liveness::Running,
            (_, false) => Liveness::Stale,
        }
    }

    /// Process exit code for the query: 0 only while running.
    pub fn exit_code(&self) -> i32 {
        match self.liveness() {
            Liveness::Running => 0,
            Liveness::Stopped | Liveness::Stale => 1,
        }
    }

    /// Multi-line human readable report. `now` is the current monotonic
    /// time, used to turn launch times into uptimes.
    pub fn render_text(&self, now: Timestamp) -> String {
        let sup = &self.record.supervisor;
        let mut out = String::new();

        let state = match self.liveness() {
            Liveness::Running => "running",
            Liveness::Stopped if sup.gave_up => "gave up",
            Liveness::Stopped => "stopped",
            Liveness::Stale => "stale (supervisor died)",
        };
        let _ = writeln!(out, "{}: {state}", self.name);
        if sup.pid == 0 {
            let _ = writeln!(out, "  supervisor     not running");
        } else {
            let _ = writeln!(out, "  supervisor     pid {}", sup.pid);
        }
        let _ = writeln!(out, "  started        {}", format_wall_clock(sup.started_at));
        let _ = writeln!(out, "                {}", format_utc(sup.started_at));
        let _ = writeln!(
            out,
            "  backoff        {}",
            if sup.timeout_seconds == 0 {
                "none (gives up)".to_string()
            } else {
                format!("{}s", sup.timeout_seconds)
            }
        );
        let _ = writeln!(out, "  gave up        {}", if sup.gave_up { "yes" } else { "no" });

        for kind in SlotKind::ALL {
            let slot = self.record.slot(kind);
            if kind == SlotKind::Log && slot.never_started() {
                continue;
            }
            let _ = writeln!(out, "  {kind}: {}", describe_slot(slot, now));
            let _ = writeln!(
                out,
                "       restarts {} total, {}/{} within {}",
                slot.total_restarts,
                slot.recent_restarts,
                slot.max_recent_restarts,
                describe_window(slot.recent_window_seconds),
            );
            if slot.total_restarts > 0 {
                let _ = writeln!(
                    out,
                    "       last exit {}",
                    describe_wait_status(slot.last_exit_status)
                );
            }
        }
        out
    }

    /// Supervisor, command and log pids, one per line; `n/a` for none.
    pub fn render_pids(&self) -> String {
        let pid = |p: i32| {
            if p > 0 {
                p.to_string()
            } else {
                "n/a".to_string()
            }
        };
        format!(
            "{}\n{}\n{}\n",
            pid(self.record.supervisor.pid),
            pid(self.record.slot(SlotKind::Command).pid),
            pid(self.record.slot(SlotKind::Log).pid),
        )
    }

    /// Machine readable report.
    pub fn render_json(&self) -> FsvResult<String> {
        #[derive(Serialize)]
        struct JsonReport<'a> {
            name: &'a str,
            state: Liveness,
            lock_held: bool,
            supervisor: &'a SupervisorState,
            command: &'a ChildSlot,
            log: &'a ChildSlot,
        }

        let report = JsonReport {
            name: &self.name,
            state: self.liveness(),
            lock_held: self.lock_held,
            supervisor: &self.record.supervisor,
            command: self.record.slot(SlotKind::Command),
            log: self.record.slot(SlotKind::Log),
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }
}

fn describe_slot(slot: &ChildSlot, now: Timestamp) -> String {
    if slot.is_running() {
        let up = now.duration_since(slot.launched_at).as_secs();
        format!("pid {}, up {}", slot.pid, format_seconds(up))
    } else if slot.never_started() {
        "never started".to_string()
    } else {
        "not running".to_string()
    }
}

fn describe_window(secs: u64) -> String {
    if secs == 0 {
        "forever".to_string()
    } else {
        format_seconds(secs)
    }
}

/// `90061` -> `1d 1h 1m 1s`.
pub fn format_seconds(secs: u64) -> String {
    let (d, rem) = (secs / 86_400, secs % 86_400);
    let (h, rem) = (rem / 3_600, rem % 3_600);
    let (m, s) = (rem / 60, rem % 60);
    let mut out = String::new();
    for (value, unit) in [(d, "d"), (h, "h"), (m, "m")] {
        if value > 0 || !out.is_empty() {
            let _ = write!(out, "{value}{unit} ");
        }
    }
    let _ = write!(out, "{s}s");
    out
}

/// Local time rendering of a `CLOCK_REALTIME` timestamp.
pub fn format_wall_clock(ts: Timestamp) -> String {
    if ts.is_zero() {
        return "-".to_string();
    }
    match DateTime::from_timestamp(ts.secs, ts.nanos.clamp(0, 999_999_999) as u32) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S %z")
            .to_string(),
        None => format!("@{}", ts.secs),
    }
}

/// UTC rendering of a `CLOCK_REALTIME` timestamp.
pub fn format_utc(ts: Timestamp) -> String {
    if ts.is_zero() {
        return "-".to_string();
    }
    match DateTime::from_timestamp(ts.secs, ts.nanos.clamp(0, 999_999_999) as u32) {
        Some(utc) => utc.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("@{}", ts.secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsv_common::config::SlotLimits;
    use fsv_common::snapshot::SupervisorState;

    fn report(pid: i32, lock_held: bool) -> StatusReport {
        let mut record = SnapshotRecord {
            supervisor: SupervisorState {
                pid,
                started_at: Timestamp::new(1_700_000_000, 0),
                gave_up: false,
                timeout_seconds: 0,
            },
            slots: [ChildSlot::new(SlotLimits::default()); 2],
        };
        let cmd = record.slot_mut(SlotKind::Command);
        cmd.pid = 4242;
        cmd.launched_at = Timestamp::new(100, 0);
        StatusReport {
            name: "web".into(),
            record,
            lock_held,
        }
    }

    #[test]
    fn liveness_needs_pid_and_lock() {
        assert_eq!(report(10, true).liveness(), Liveness::Running);
        assert_eq!(report(10, true).exit_code(), 0);
        assert_eq!(report(10, false).liveness(), Liveness::Stale);
        assert_eq!(report(10, false).exit_code(), 1);
        assert_eq!(report(0, false).liveness(), Liveness::Stopped);
        assert_eq!(report(0, true).exit_code(), 1);
    }

    #[test]
    fn pids_line() {
        assert_eq!(report(10, true).render_pids(), "10\n4242\nn/a\n");
    }

    #[test]
    fn text_report_mentions_uptime_and_hides_unused_logger() {
        let text = report(10, true).render_text(Timestamp::new(100 + 3_725, 0));
        assert!(text.starts_with("web: running\n"), "{text}");
        assert!(text.contains("supervisor     pid 10"), "{text}");
        assert!(text.contains("2023-11-14 22:13:20 UTC"), "{text}");
        assert!(text.contains("gave up        no"), "{text}");
        assert!(text.contains("cmd: pid 4242, up 1h 2m 5s"), "{text}");
        assert!(!text.contains("log:"), "{text}");
        assert!(!text.contains("last exit"), "{text}");
    }

    #[test]
    fn text_report_shows_last_exit() {
        let mut r = report(0, false);
        r.record.supervisor.gave_up = true;
        let cmd = r.record.slot_mut(SlotKind::Command);
        cmd.pid = 0;
        cmd.total_restarts = 4;
        cmd.recent_restarts = 4;
        cmd.last_exit_status = 1 << 8;
        let text = r.render_text(Timestamp::new(200, 0));
        assert!(text.starts_with("web: gave up\n"), "{text}");
        assert!(text.contains("supervisor     not running"), "{text}");
        assert!(text.contains("restarts 4 total, 4/3 within 1h 0m 0s"), "{text}");
        assert!(text.contains("last exit exited with status 1"), "{text}");
    }

    #[test]
    fn json_report_is_parseable() {
        let json = report(10, false).render_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state"], "stale");
        assert_eq!(value["command"]["pid"], 4242);
        assert_eq!(value["log"]["pid"], 0);
        assert_eq!(value["supervisor"]["gave_up"], false);
    }

    #[test]
    fn seconds_formatting() {
        assert_eq!(format_seconds(0), "0s");
        assert_eq!(format_seconds(61), "1m 1s");
        assert_eq!(format_seconds(3_600), "1h 0m 0s");
        assert_eq!(format_seconds(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn zero_wall_clock_is_dash() {
        assert_eq!(format_wall_clock(Timestamp::ZERO), "-");
        assert!(!format_wall_clock(Timestamp::new(1_700_000_000, 0)).is_empty());
    }
}
