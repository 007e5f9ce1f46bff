//! Prelude module for common re-exports.
//!
//! ```rust
//! use fsv_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    CommandSpec, ConfigError, ConfigLoader, LogLevel, OutputMask, OutputMode, ServiceConfig,
    ServiceFile, SlotLimits,
};

// ─── Time ───────────────────────────────────────────────────────────
pub use crate::clock::Timestamp;

// ─── Snapshot ───────────────────────────────────────────────────────
pub use crate::snapshot::{ChildSlot, SNAPSHOT_SIZE, SlotKind, SnapshotRecord, SupervisorState};
pub use crate::store::{SnapshotStore, StoreError};

// ─── State directory ────────────────────────────────────────────────
pub use crate::state_dir::{LockGuard, StateDir, StateDirError};
