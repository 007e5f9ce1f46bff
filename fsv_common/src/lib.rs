//! FSV Common Library
//!
//! Shared pieces of the `fsv` supervisor that both the running daemon and
//! the status query side need to agree on.
//!
//! # Module Structure
//!
//! - [`consts`] - Defaults, file names and fixed delays
//! - [`config`] - Configuration surface and TOML loading
//! - [`clock`] - Monotonic / wall-clock timestamps
//! - [`snapshot`] - Status record and its fixed binary layout
//! - [`store`] - Writing and reading the status file
//! - [`state_dir`] - Per-service state directory and lockfile
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use fsv_common::prelude::*;
//! ```

pub mod clock;
pub mod config;
pub mod consts;
pub mod prelude;
pub mod snapshot;
pub mod state_dir;
pub mod store;
