//! Constants for the fsv workspace.
//!
//! Single source of truth for default limits, file names and delays.

use std::time::Duration;

/// Default state directory prefix; `fsv-<euid>/<name>` is created below it.
pub const DEFAULT_STATE_PREFIX: &str = "/tmp";

/// Environment variable overriding [`DEFAULT_STATE_PREFIX`].
pub const STATE_PREFIX_ENV: &str = "FSV_STATE_DIR";

/// Name of the status snapshot file inside a service directory.
pub const SNAPSHOT_FILE: &str = "info.struct";

/// Name of the lockfile inside a service directory.
pub const LOCK_FILE: &str = "lock";

/// Default restart limit within the recent window.
pub const DEFAULT_MAX_RECENT_RESTARTS: u64 = 3;

/// Default width of the recent window in seconds.
pub const DEFAULT_RECENT_WINDOW_SECS: u64 = 3600;

/// Default backoff; 0 means give up instead of waiting.
pub const DEFAULT_TIMEOUT_SECS: u64 = 0;

/// Delay before retrying a launch whose `fork`/`pipe` failed.
pub const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Period of the safety-net wake-up that re-runs the reaper.
pub const SAFETY_NET_INTERVAL: Duration = Duration::from_secs(30);

/// Exit status of a child whose `exec` failed (`EX_USAGE` from sysexits.h).
pub const EXEC_FAILURE_STATUS: i32 = 64;

/// Exit status for command-line usage errors.
pub const EX_USAGE: i32 = 64;

/// Shell used for string commands.
pub const SHELL_PATH: &str = "/bin/sh";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_sane() {
        assert!(LAUNCH_RETRY_DELAY < Duration::from_secs(1));
        assert!(SAFETY_NET_INTERVAL > LAUNCH_RETRY_DELAY);
    }

    #[test]
    fn file_names_are_plain() {
        assert!(!SNAPSHOT_FILE.contains('/'));
        assert!(!LOCK_FILE.contains('/'));
        assert_ne!(SNAPSHOT_FILE, LOCK_FILE);
    }
}
