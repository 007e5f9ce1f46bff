//! Error types for the supervisor binary.

use fsv_common::config::ConfigError;
use fsv_common::snapshot::SlotKind;
use fsv_common::state_dir::StateDirError;
use fsv_common::store::StoreError;
use thiserror::Error;

/// Errors raised while starting a child process.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// `fork(2)` failed, usually from process or memory limits.
    #[error("fork failed: {source}")]
    Fork {
        /// Underlying errno
        source: nix::Error,
    },

    /// The log pipe could not be created.
    #[error("cannot create log pipe: {source}")]
    Pipe {
        /// Underlying errno
        source: nix::Error,
    },

    /// `/dev/null` could not be opened for the unused descriptors.
    #[error("cannot open /dev/null: {source}")]
    DevNull {
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A program name or argument cannot be passed to `exec`.
    #[error("argument contains a NUL byte: {arg:?}")]
    InvalidArgument {
        /// Offending argument
        arg: String,
    },

    /// The slot has no command configured.
    #[error("no {slot} command configured")]
    NotConfigured {
        /// Slot that was asked for
        slot: SlotKind,
    },
}

/// Top-level supervisor errors.
#[derive(Error, Debug)]
pub enum FsvError {
    /// Bad configuration or command line.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// State directory or lock problem.
    #[error(transparent)]
    StateDir(#[from] StateDirError),

    /// Status file could not be read or written.
    #[error("status file: {0}")]
    Store(#[from] StoreError),

    /// Child process could not be prepared.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Signal mask, timer or daemonization failure.
    #[error("{context}: {source}")]
    System {
        /// What was being attempted
        context: &'static str,
        /// Underlying errno
        source: nix::Error,
    },

    /// Status output could not be serialized.
    #[error("cannot encode status: {0}")]
    Json(#[from] serde_json::Error),
}

impl FsvError {
    /// Wrap an errno with a short description of the failing step.
    pub fn system(context: &'static str) -> impl FnOnce(nix::Error) -> FsvError {
        move |source| FsvError::System { context, source }
    }
}

/// Result alias for supervisor operations.
pub type FsvResult<T> = Result<T, FsvError>;
