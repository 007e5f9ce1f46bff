//! Restart policy.
//!
//! Decides, after a child exits, whether to relaunch it right away, wait
//! out the backoff first, or stop supervising altogether.
//!
//! The "recent window" is a resetting counter rather than a true sliding
//! window: if the child ran longer than the window before dying, the
//! episode starts over at 1. That is enough to tell a crash loop from an
//! occasional restart with O(1) state.

use fsv_common::clock::Timestamp;
use fsv_common::snapshot::{ChildSlot, SlotKind};
use std::time::Duration;

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch immediately.
    RestartNow,
    /// Relaunch after the backoff elapses.
    WaitThenRestart(Duration),
    /// Stop supervising; the supervisor exits.
    GiveUp,
}

/// Account for one exit of `slot` and decide what happens next.
///
/// Bumps `total_restarts`, then updates `recent_restarts`: it increments
/// while the last launch is inside the window (or the window is 0) and
/// resets to 1 otherwise. Exceeding `max_recent_restarts` gives up when
/// `timeout_secs` is 0 or the slot is the log slot, else backs off for
/// `timeout_secs`.
pub fn evaluate(
    slot: &mut ChildSlot,
    kind: SlotKind,
    now: Timestamp,
    timeout_secs: u64,
) -> RestartDecision {
    slot.total_restarts = slot.total_restarts.saturating_add(1);

    let window = slot.recent_window_seconds;
    let within_window = window == 0
        || now.whole_secs_since(slot.launched_at) <= i64::try_from(window).unwrap_or(i64::MAX);
    if within_window {
        slot.recent_restarts = slot.recent_restarts.saturating_add(1);
    } else {
        slot.recent_restarts = 1;
    }

    if slot.recent_restarts <= slot.max_recent_restarts {
        return RestartDecision::RestartNow;
    }

    // A broken logger must not park the supervisor in a wait while the
    // command runs unsupervised.
    if timeout_secs == 0 || kind == SlotKind::Log {
        RestartDecision::GiveUp
    } else {
        RestartDecision::WaitThenRestart(Duration::from_secs(timeout_secs))
    }
}
