//! # fsv
//!
//! A small process supervisor. It runs one command, restarts it when it
//! exits, optionally pipes its stdout/stderr into a second "log" process
//! (itself supervised), and publishes a fixed-layout status record that
//! other processes can query without talking to the supervisor.
//!
//! # Module Structure
//!
//! - [`policy`] - Crash-loop detection and restart decisions
//! - [`launcher`] - `fork`/`exec` with descriptor rewiring
//! - [`events`] - Blocked signals, `sigwait`, slot timers
//! - [`host`] - OS seam used by the supervisor
//! - [`supervisor`] - The supervision state machine
//! - [`status`] - Status queries and rendering
//! - [`error`] - Error types

pub mod error;
pub mod events;
pub mod host;
pub mod launcher;
pub mod policy;
pub mod status;
pub mod supervisor;

pub use error::{FsvError, FsvResult, LaunchError};
pub use supervisor::{ExitReason, Phase, Supervisor};
