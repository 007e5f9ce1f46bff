//! The supervision state machine.
//!
//! Owns the status record and reacts to one [`WakeReason`] at a time:
//!
//! ```text
//!   Starting ──► Running ◄──────────────┐
//!                  │  child exits       │ relaunch
//!                  ├─► restart now ─────┤
//!                  ├─► TimingOut ───────┤ (backoff timer)
//!                  ├─► AwaitingRestart ─┘ (fork failed, short retry)
//!                  └─► give up ──► Exiting
//!   any ── SIGINT/SIGHUP/SIGTERM ──► Exiting
//! ```
//!
//! Every transition is followed by a write of the status file.

use crate::error::FsvResult;
use crate::events::{EventSource, WakeReason};
use crate::host::{ChildExit, ProcessHost, describe_wait_status};
use crate::policy::{self, RestartDecision};
use fsv_common::clock::Timestamp;
use fsv_common::config::ServiceConfig;
use fsv_common::consts::LAUNCH_RETRY_DELAY;
use fsv_common::snapshot::{ChildSlot, SlotKind, SnapshotRecord, SupervisorState};
use fsv_common::store::SnapshotStore;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Relaunch owed to a slot that is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    /// Launch failed; retry after [`LAUNCH_RETRY_DELAY`].
    Retry { due: Timestamp },
    /// Crash loop detected; wait until `due`.
    Backoff { due: Timestamp },
}

impl Pending {
    fn due(self) -> Option<Timestamp> {
        match self {
            Pending::Idle => None,
            Pending::Retry { due } | Pending::Backoff { due } => Some(due),
        }
    }
}

/// Where the supervisor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Children not launched yet.
    Starting,
    /// Every configured slot has a live child.
    Running,
    /// A launch failed and will be retried shortly.
    AwaitingRestart(SlotKind),
    /// Backing off after a crash loop.
    TimingOut { slot: SlotKind, until: Timestamp },
    /// Shutting down or gave up.
    Exiting,
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Asked to stop by a signal.
    Signalled(Signal),
    /// This slot restarted too often.
    GaveUp(SlotKind),
}

/// Supervises one command and its optional log process.
pub struct Supervisor<H: ProcessHost> {
    host: H,
    store: SnapshotStore,
    record: SnapshotRecord,
    logging: bool,
    pending: [Pending; 2],
    started: bool,
    exit: Option<ExitReason>,
}

impl<H: ProcessHost> Supervisor<H> {
    /// `pid` and `started_at` describe the supervisor process itself.
    pub fn new(
        config: &ServiceConfig,
        host: H,
        store: SnapshotStore,
        pid: i32,
        started_at: Timestamp,
    ) -> Self {
        let record = SnapshotRecord {
            supervisor: SupervisorState {
                pid,
                started_at,
                gave_up: false,
                timeout_seconds: config.timeout_secs,
            },
            slots: [
                ChildSlot::new(config.command_limits),
                ChildSlot::new(config.log_limits),
            ],
        };
        Self {
            host,
            store,
            record,
            logging: config.logging_enabled(),
            pending: [Pending::Idle; 2],
            started: false,
            exit: None,
        }
    }

    /// Current status record.
    pub fn record(&self) -> &SnapshotRecord {
        &self.record
    }

    #[cfg(test)]
    fn host(&self) -> &H {
        &self.host
    }

    #[cfg(test)]
    fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Lifecycle phase derived from the slots.
    pub fn phase(&self) -> Phase {
        if self.exit.is_some() {
            return Phase::Exiting;
        }
        if !self.started {
            return Phase::Starting;
        }
        for slot in self.active_slots() {
            match self.pending[slot.index()] {
                Pending::Backoff { due } => return Phase::TimingOut { slot, until: due },
                Pending::Retry { .. } => return Phase::AwaitingRestart(slot),
                Pending::Idle if !self.record.slot(slot).is_running() => {
                    return Phase::AwaitingRestart(slot);
                }
                Pending::Idle => {}
            }
        }
        Phase::Running
    }

    fn active_slots(&self) -> impl Iterator<Item = SlotKind> + use<H> {
        let logging = self.logging;
        SlotKind::ALL
            .into_iter()
            .filter(move |slot| *slot == SlotKind::Command || logging)
    }

    /// Launch the log process (if any) and the command.
    pub fn start(&mut self) {
        info!(
            pid = self.record.supervisor.pid,
            logging = self.logging,
            timeout = self.record.supervisor.timeout_seconds,
            "supervisor starting"
        );
        if self.logging {
            self.launch(SlotKind::Log);
        }
        self.launch(SlotKind::Command);
        self.started = true;
        self.persist();
    }

    /// Process wake-ups until the supervisor decides to exit.
    ///
    /// If the event source itself fails, children are terminated and the
    /// final record written before the error is returned.
    pub fn run<E: EventSource>(&mut self, events: &mut E) -> FsvResult<ExitReason> {
        if !self.started {
            self.start();
        }
        loop {
            let reason = match events.next_event() {
                Ok(reason) => reason,
                Err(e) => {
                    error!("waiting for events failed: {e}");
                    self.terminate_children();
                    self.record.supervisor.pid = 0;
                    self.persist();
                    return Err(e);
                }
            };
            if let Some(exit) = self.handle(reason) {
                return Ok(exit);
            }
        }
    }

    /// React to one wake-up. Returns the exit reason once the supervisor
    /// is done.
    pub fn handle(&mut self, reason: WakeReason) -> Option<ExitReason> {
        if self.exit.is_some() {
            return self.exit;
        }
        debug!(?reason, "wake");
        match reason {
            WakeReason::ChildExited => self.reap_children(),
            WakeReason::Periodic => {
                self.reap_children();
                if self.exit.is_none() {
                    self.relaunch_overdue();
                }
            }
            WakeReason::RestartDue(slot) => self.restart_due(slot),
            WakeReason::Terminate(signal) => self.shutdown(signal),
        }
        self.exit
    }

    fn reap_children(&mut self) {
        while let Some(ChildExit { pid, status }) = self.host.reap() {
            match self.slot_of(pid) {
                Some(slot) => self.child_exited(slot, status),
                None => debug!(pid, status = %describe_wait_status(status), "reaped unknown child"),
            }
            if self.exit.is_some() {
                return;
            }
        }
    }

    fn slot_of(&self, pid: i32) -> Option<SlotKind> {
        if pid <= 0 {
            return None;
        }
        SlotKind::ALL
            .into_iter()
            .find(|slot| self.record.slot(*slot).pid == pid)
    }

    fn child_exited(&mut self, slot: SlotKind, status: i32) {
        let now = self.host.now();
        let timeout = self.record.supervisor.timeout_seconds;
        let child = self.record.slot_mut(slot);
        let pid = child.pid;
        child.pid = 0;
        child.last_exit_status = status;
        let decision = policy::evaluate(child, slot, now, timeout);
        info!(
            %slot,
            pid,
            status = %describe_wait_status(status),
            recent = child.recent_restarts,
            total = child.total_restarts,
            "child exited"
        );

        match decision {
            RestartDecision::RestartNow => self.launch(slot),
            RestartDecision::WaitThenRestart(delay) => {
                warn!(%slot, "restarting too fast, waiting {}s", delay.as_secs());
                self.pending[slot.index()] = Pending::Backoff {
                    due: now.saturating_add(delay),
                };
                self.arm(slot, delay);
            }
            RestartDecision::GiveUp => {
                self.give_up(slot);
                return;
            }
        }
        self.persist();
    }

    fn restart_due(&mut self, slot: SlotKind) {
        if slot == SlotKind::Log && !self.logging {
            debug!("log wake-up without a log process");
            return;
        }
        if self.record.slot(slot).is_running() {
            debug!(%slot, "wake-up for a running child ignored");
            return;
        }
        self.launch(slot);
        self.persist();
    }

    /// Safety net for lost timer signals.
    fn relaunch_overdue(&mut self) {
        let now = self.host.now();
        let overdue: Vec<SlotKind> = self
            .active_slots()
            .filter(|slot| {
                self.pending[slot.index()]
                    .due()
                    .is_some_and(|due| due <= now)
            })
            .collect();
        for slot in overdue {
            debug!(%slot, "relaunch overdue");
            self.restart_due(slot);
        }
    }

    fn launch(&mut self, slot: SlotKind) {
        let now = self.host.now();
        match self.host.launch(slot) {
            Ok(pid) => {
                let child = self.record.slot_mut(slot);
                child.pid = pid;
                child.launched_at = now;
                self.pending[slot.index()] = Pending::Idle;
                info!(%slot, pid, "started");
            }
            Err(e) => {
                warn!(%slot, "launch failed, retrying in {:?}: {e}", LAUNCH_RETRY_DELAY);
                self.pending[slot.index()] = Pending::Retry {
                    due: now.saturating_add(LAUNCH_RETRY_DELAY),
                };
                self.arm(slot, LAUNCH_RETRY_DELAY);
            }
        }
    }

    fn arm(&mut self, slot: SlotKind, after: Duration) {
        if let Err(e) = self.host.arm_wakeup(slot, after) {
            error!(%slot, "cannot arm wake-up timer, relying on periodic tick: {e}");
        }
    }

    fn give_up(&mut self, slot: SlotKind) {
        error!(%slot, "restarting too fast, giving up");
        self.record.supervisor.gave_up = true;
        self.terminate_children();
        self.record.supervisor.pid = 0;
        self.persist();
        self.exit = Some(ExitReason::GaveUp(slot));
    }

    fn shutdown(&mut self, signal: Signal) {
        info!(?signal, "shutting down");
        self.terminate_children();
        self.record.supervisor.pid = 0;
        self.persist();
        self.exit = Some(ExitReason::Signalled(signal));
    }

    /// SIGTERM then SIGCONT to every live child, and forget them.
    fn terminate_children(&mut self) {
        for slot in SlotKind::ALL {
            let pid = self.record.slot(slot).pid;
            if pid > 0 {
                for signal in [Signal::SIGTERM, Signal::SIGCONT] {
                    match self.host.signal(pid, signal) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => warn!(%slot, pid, ?signal, "cannot signal child: {e}"),
                    }
                }
                debug!(%slot, pid, "terminated");
            }
            self.record.slot_mut(slot).pid = 0;
            self.pending[slot.index()] = Pending::Idle;
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.write(&self.record) {
            warn!(path = %self.store.path().display(), "cannot write status file: {e}");
        }
    }
}
