//! Operating-system side of supervision.
//!
//! [`ProcessHost`] is the seam between the supervision state machine and
//! the kernel: forking, reaping, signalling and timers. The real
//! implementation is [`SystemHost`]; tests drive the supervisor with a
//! scripted host instead.

use crate::error::LaunchError;
use crate::events::SlotTimers;
use crate::launcher::ForkExecLauncher;
use fsv_common::clock::Timestamp;
use fsv_common::snapshot::SlotKind;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::time::Duration;

/// A reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Pid of the exited child.
    pub pid: i32,
    /// Raw `wait(2)` status.
    pub status: i32,
}

/// Everything the supervisor asks of the operating system.
pub trait ProcessHost {
    /// Start the child for `slot`, returning its pid.
    fn launch(&mut self, slot: SlotKind) -> Result<i32, LaunchError>;

    /// Collect one exited child without blocking.
    fn reap(&mut self) -> Option<ChildExit>;

    /// Deliver `signal` to `pid`.
    fn signal(&mut self, pid: i32, signal: Signal) -> nix::Result<()>;

    /// Arrange a [`crate::events::WakeReason::RestartDue`] for `slot`.
    fn arm_wakeup(&mut self, slot: SlotKind, after: Duration) -> nix::Result<()>;

    /// Monotonic time used for restart accounting.
    fn now(&self) -> Timestamp;
}

/// [`ProcessHost`] backed by real processes and POSIX timers.
pub struct SystemHost {
    launcher: ForkExecLauncher,
    timers: SlotTimers,
}

impl SystemHost {
    pub fn new(launcher: ForkExecLauncher, timers: SlotTimers) -> Self {
        Self { launcher, timers }
    }
}

impl ProcessHost for SystemHost {
    fn launch(&mut self, slot: SlotKind) -> Result<i32, LaunchError> {
        self.launcher.launch(slot).map(Pid::as_raw)
    }

    fn reap(&mut self) -> Option<ChildExit> {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: waitpid(-1, WNOHANG) with a valid status pointer.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            // > 0: reaped; 0: children remain but none exited; < 0: ECHILD.
            if pid > 0 {
                return Some(ChildExit { pid, status });
            }
            if pid == 0 || Errno::last() != Errno::EINTR {
                return None;
            }
        }
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(pid), signal)
    }

    fn arm_wakeup(&mut self, slot: SlotKind, after: Duration) -> nix::Result<()> {
        self.timers.arm(slot, after)
    }

    fn now(&self) -> Timestamp {
        Timestamp::monotonic()
    }
}

/// Describe a raw `wait(2)` status.
pub fn describe_wait_status(status: i32) -> String {
    if libc::WIFEXITED(status) {
        format!("exited with status {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        let name = Signal::try_from(sig).map_or("unknown signal", Signal::as_str);
        let core = if libc::WCOREDUMP(status) {
            " (core dumped)"
        } else {
            ""
        };
        format!("killed by signal {sig} ({name}){core}")
    } else {
        format!("unknown status {status:#x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_descriptions() {
        assert_eq!(describe_wait_status(0), "exited with status 0");
        assert_eq!(describe_wait_status(64 << 8), "exited with status 64");
        assert_eq!(describe_wait_status(9), "killed by signal 9 (SIGKILL)");
        assert_eq!(
            describe_wait_status(6 | 0x80),
            "killed by signal 6 (SIGABRT) (core dumped)"
        );
    }
}
