//! Wake-up sources for the supervision loop.
//!
//! The supervisor is single threaded and never runs signal handlers. Every
//! signal it cares about is blocked at startup and collected synchronously
//! with `sigwait`, so state is only ever touched from the loop itself.
//!
//! | Signal    | Meaning                                      |
//! |-----------|----------------------------------------------|
//! | `SIGCHLD` | a child changed state                        |
//! | `SIGUSR1` | command slot timer (backoff or fork retry)   |
//! | `SIGUSR2` | log slot timer (fork retry)                  |
//! | `SIGALRM` | periodic safety net, reaps missed exits      |
//! | `SIGINT`, `SIGHUP`, `SIGTERM` | shut down                        |

use crate::error::{FsvError, FsvResult};
use fsv_common::consts::SAFETY_NET_INTERVAL;
use fsv_common::snapshot::SlotKind;
use nix::sys::signal::{SigEvent, SigSet, SigevNotify, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;
use std::time::Duration;
use tracing::debug;

/// Signal raised by the command slot's timer.
pub const COMMAND_WAKEUP: Signal = Signal::SIGUSR1;
/// Signal raised by the log slot's timer.
pub const LOG_WAKEUP: Signal = Signal::SIGUSR2;
/// Signal raised by the periodic safety-net timer.
pub const SAFETY_NET: Signal = Signal::SIGALRM;

/// Why the loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// At least one child may have exited.
    ChildExited,
    /// A pending relaunch of this slot is due.
    RestartDue(SlotKind),
    /// Asked to stop.
    Terminate(Signal),
    /// Periodic tick; treated like [`WakeReason::ChildExited`].
    Periodic,
}

impl WakeReason {
    /// Map a delivered signal to a wake reason.
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGCHLD => Some(Self::ChildExited),
            COMMAND_WAKEUP => Some(Self::RestartDue(SlotKind::Command)),
            LOG_WAKEUP => Some(Self::RestartDue(SlotKind::Log)),
            SAFETY_NET => Some(Self::Periodic),
            Signal::SIGINT | Signal::SIGHUP | Signal::SIGTERM => Some(Self::Terminate(signal)),
            _ => None,
        }
    }
}

/// Every signal the loop waits for.
pub fn supervised_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGCHLD,
        COMMAND_WAKEUP,
        LOG_WAKEUP,
        SAFETY_NET,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGTERM,
    ] {
        set.add(signal);
    }
    set
}

/// Source of wake-ups for [`crate::supervisor::Supervisor::run`].
pub trait EventSource {
    /// Block until the next wake-up.
    fn next_event(&mut self) -> FsvResult<WakeReason>;
}

/// Wake-ups collected with `sigwait`.
pub struct SignalEvents {
    mask: SigSet,
    _safety_net: Timer,
}

impl SignalEvents {
    /// Block the supervised signals and start the periodic tick.
    ///
    /// Must run before any child is forked, otherwise an early `SIGCHLD`
    /// would be delivered with its default disposition and lost.
    pub fn install() -> FsvResult<Self> {
        let mask = supervised_signals();
        mask.thread_block()
            .map_err(FsvError::system("cannot block signals"))?;

        let mut timer = signal_timer(SAFETY_NET)?;
        let period = TimeSpec::from_duration(SAFETY_NET_INTERVAL);
        timer
            .set(Expiration::Interval(period), TimerSetTimeFlags::empty())
            .map_err(FsvError::system("cannot arm periodic timer"))?;

        Ok(Self {
            mask,
            _safety_net: timer,
        })
    }
}

impl EventSource for SignalEvents {
    fn next_event(&mut self) -> FsvResult<WakeReason> {
        loop {
            let signal = self.mask.wait().map_err(FsvError::system("sigwait"))?;
            match WakeReason::from_signal(signal) {
                Some(reason) => return Ok(reason),
                None => debug!(?signal, "ignoring unexpected signal"),
            }
        }
    }
}

/// One-shot timers that wake a slot by signal.
pub struct SlotTimers {
    command: Timer,
    log: Timer,
}

impl SlotTimers {
    /// Create both timers, initially disarmed.
    pub fn new() -> FsvResult<Self> {
        Ok(Self {
            command: signal_timer(COMMAND_WAKEUP)?,
            log: signal_timer(LOG_WAKEUP)?,
        })
    }

    /// Fire the wake-up for `slot` after `after`, replacing any pending one.
    pub fn arm(&mut self, slot: SlotKind, after: Duration) -> nix::Result<()> {
        let timer = match slot {
            SlotKind::Command => &mut self.command,
            SlotKind::Log => &mut self.log,
        };
        // A zero expiration would disarm instead of firing.
        let after = after.max(Duration::from_nanos(1));
        timer.set(
            Expiration::OneShot(TimeSpec::from_duration(after)),
            TimerSetTimeFlags::empty(),
        )
    }
}

fn signal_timer(signal: Signal) -> FsvResult<Timer> {
    let event = SigEvent::new(SigevNotify::SigevSignal {
        signal,
        si_value: 0,
    });
    Timer::new(ClockId::CLOCK_MONOTONIC, event).map_err(FsvError::system("cannot create timer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_supervised_signal() {
        for signal in supervised_signals().iter() {
            assert!(
                WakeReason::from_signal(signal).is_some(),
                "{signal:?} has no meaning"
            );
        }
    }

    #[test]
    fn slot_wakeups_are_distinct() {
        assert_eq!(
            WakeReason::from_signal(COMMAND_WAKEUP),
            Some(WakeReason::RestartDue(SlotKind::Command))
        );
        assert_eq!(
            WakeReason::from_signal(LOG_WAKEUP),
            Some(WakeReason::RestartDue(SlotKind::Log))
        );
    }

    #[test]
    fn shutdown_signals_terminate() {
        for signal in [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM] {
            assert_eq!(
                WakeReason::from_signal(signal),
                Some(WakeReason::Terminate(signal))
            );
        }
        assert_eq!(WakeReason::from_signal(Signal::SIGQUIT), None);
    }
}
