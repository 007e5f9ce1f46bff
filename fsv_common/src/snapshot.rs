//! Status snapshot: the supervisor's live state and its on-disk layout.
//!
//! The snapshot is the only channel between a running supervisor and any
//! other process. It is a flat record with an explicit little-endian
//! layout so the file format does not depend on in-memory representation.
//!
//! ## Layout (160 bytes)
//!
//! ```text
//! offset  size  field
//!      0     8  magic "FSVSNAP\0"
//!      8     4  layout version (u32)
//!     12     4  reserved
//!     16    32  SupervisorState
//!     48    56  ChildSlot (command)
//!    104    56  ChildSlot (log)
//! ```
//!
//! SupervisorState: `pid i32, gave_up u32, started_at.secs i64,
//! started_at.nanos i64, timeout_seconds u64`.
//!
//! ChildSlot: `pid i32, last_exit_status i32, launched_at.secs i64,
//! launched_at.nanos i64, total_restarts u64, recent_restarts u64,
//! recent_window_seconds u64, max_recent_restarts u64`.

use crate::clock::Timestamp;
use crate::config::SlotLimits;
use crate::store::StoreError;
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;

/// Magic bytes identifying a snapshot file: `"FSVSNAP\0"`.
pub const SNAPSHOT_MAGIC: [u8; 8] = *b"FSVSNAP\0";

/// Current layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;
const SUPERVISOR_SIZE: usize = 32;
const SLOT_SIZE: usize = 56;

/// Total encoded size of a [`SnapshotRecord`].
pub const SNAPSHOT_SIZE: usize = HEADER_SIZE + SUPERVISOR_SIZE + 2 * SLOT_SIZE;

const_assert_eq!(SNAPSHOT_SIZE, 160);

/// The two supervised roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// The supervised command.
    Command,
    /// The process reading the command's output.
    Log,
}

impl SlotKind {
    /// Both slots in snapshot order.
    pub const ALL: [SlotKind; 2] = [SlotKind::Command, SlotKind::Log];

    /// Index into the slot array.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            SlotKind::Command => 0,
            SlotKind::Log => 1,
        }
    }

    /// Short name used in logs and status output.
    pub const fn as_str(self) -> &'static str {
        match self {
            SlotKind::Command => "cmd",
            SlotKind::Log => "log",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide supervisor record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorState {
    /// Supervisor pid; 0 once it has decided to exit.
    pub pid: i32,
    /// Wall-clock time the supervisor started.
    pub started_at: Timestamp,
    /// Set when a slot exceeded its limits and no backoff was allowed.
    pub gave_up: bool,
    /// Backoff in seconds; 0 means give up instead of waiting.
    pub timeout_seconds: u64,
}

/// Bookkeeping for one supervised child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChildSlot {
    /// Child pid; 0 when not running.
    pub pid: i32,
    /// Monotonic time of the most recent launch.
    pub launched_at: Timestamp,
    /// Lifetime count of exits handled by the restart policy.
    pub total_restarts: u64,
    /// Restarts inside the current recent window.
    pub recent_restarts: u64,
    /// Width of the recent window; 0 = never expires.
    pub recent_window_seconds: u64,
    /// Threshold that triggers give-up / backoff.
    pub max_recent_restarts: u64,
    /// Raw `wait(2)` status of the last exit; valid once `total_restarts > 0`.
    pub last_exit_status: i32,
}

impl ChildSlot {
    /// A never-launched slot carrying `limits`.
    pub fn new(limits: SlotLimits) -> Self {
        Self {
            max_recent_restarts: limits.max_recent_restarts,
            recent_window_seconds: limits.recent_window_secs,
            ..Default::default()
        }
    }

    /// `true` while a child occupies the slot.
    #[inline]
    pub const fn is_running(&self) -> bool {
        self.pid > 0
    }

    /// `true` if the slot has never been launched.
    #[inline]
    pub const fn never_started(&self) -> bool {
        self.pid == 0 && self.launched_at.is_zero()
    }
}

/// Everything written to the status file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    /// Supervisor state.
    pub supervisor: SupervisorState,
    /// Command and log slots, indexed by [`SlotKind::index`].
    pub slots: [ChildSlot; 2],
}

impl SnapshotRecord {
    /// Slot for `kind`.
    #[inline]
    pub fn slot(&self, kind: SlotKind) -> &ChildSlot {
        &self.slots[kind.index()]
    }

    /// Mutable slot for `kind`.
    #[inline]
    pub fn slot_mut(&mut self, kind: SlotKind) -> &mut ChildSlot {
        &mut self.slots[kind.index()]
    }

    /// Serialize to the fixed layout.
    pub fn encode(&self) -> [u8; SNAPSHOT_SIZE] {
        let mut buf = [0u8; SNAPSHOT_SIZE];
        let mut w = Writer::new(&mut buf);

        w.bytes(&SNAPSHOT_MAGIC);
        w.u32(SNAPSHOT_VERSION);
        w.u32(0);

        let s = &self.supervisor;
        w.i32(s.pid);
        w.u32(u32::from(s.gave_up));
        w.timestamp(s.started_at);
        w.u64(s.timeout_seconds);

        for slot in &self.slots {
            w.i32(slot.pid);
            w.i32(slot.last_exit_status);
            w.timestamp(slot.launched_at);
            w.u64(slot.total_restarts);
            w.u64(slot.recent_restarts);
            w.u64(slot.recent_window_seconds);
            w.u64(slot.max_recent_restarts);
        }

        debug_assert_eq!(w.pos, SNAPSHOT_SIZE);
        buf
    }

    /// Parse the fixed layout.
    ///
    /// Input shorter than [`SNAPSHOT_SIZE`] is never partially parsed.
    /// Bytes beyond the record are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < SNAPSHOT_SIZE {
            return Err(StoreError::Truncated {
                expected: SNAPSHOT_SIZE,
                found: bytes.len(),
            });
        }
        let mut r = Reader::new(&bytes[..SNAPSHOT_SIZE]);

        if r.bytes::<8>() != SNAPSHOT_MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = r.u32();
        if version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let _reserved = r.u32();

        let supervisor = SupervisorState {
            pid: r.i32(),
            gave_up: r.u32() != 0,
            started_at: r.timestamp(),
            timeout_seconds: r.u64(),
        };

        let mut slots = [ChildSlot::default(); 2];
        for slot in &mut slots {
            slot.pid = r.i32();
            slot.last_exit_status = r.i32();
            slot.launched_at = r.timestamp();
            slot.total_restarts = r.u64();
            slot.recent_restarts = r.u64();
            slot.recent_window_seconds = r.u64();
            slot.max_recent_restarts = r.u64();
        }

        Ok(Self { supervisor, slots })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8; SNAPSHOT_SIZE],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8; SNAPSHOT_SIZE]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn timestamp(&mut self, t: Timestamp) {
        self.bytes(&t.secs.to_le_bytes());
        self.bytes(&t.nanos.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.bytes())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.bytes())
    }

    fn timestamp(&mut self) -> Timestamp {
        let secs = self.i64();
        let nanos = self.i64();
        Timestamp::new(secs, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotRecord {
        let mut record = SnapshotRecord {
            supervisor: SupervisorState {
                pid: 4242,
                started_at: Timestamp::new(1_700_000_000, 123_456_789),
                gave_up: false,
                timeout_seconds: 5,
            },
            slots: [
                ChildSlot::new(SlotLimits::default()),
                ChildSlot::new(SlotLimits {
                    max_recent_restarts: 0,
                    recent_window_secs: 0,
                }),
            ],
        };
        let cmd = record.slot_mut(SlotKind::Command);
        cmd.pid = 4243;
        cmd.launched_at = Timestamp::new(812, 5);
        cmd.total_restarts = 9;
        cmd.recent_restarts = 2;
        cmd.last_exit_status = 0x0100;
        record
    }

    #[test]
    fn layout_offsets() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..8], b"FSVSNAP\0");
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), SNAPSHOT_VERSION);
        // supervisor pid right after the header
        assert_eq!(i32::from_le_bytes(bytes[16..20].try_into().unwrap()), 4242);
        // command slot pid at 48, log slot pid at 104
        assert_eq!(i32::from_le_bytes(bytes[48..52].try_into().unwrap()), 4243);
        assert_eq!(i32::from_le_bytes(bytes[104..108].try_into().unwrap()), 0);
        // command total_restarts at 48 + 24
        assert_eq!(u64::from_le_bytes(bytes[72..80].try_into().unwrap()), 9);
    }

    #[test]
    fn decode_returns_what_was_encoded() {
        let record = sample();
        let decoded = SnapshotRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn gave_up_flag_survives() {
        let mut record = sample();
        record.supervisor.gave_up = true;
        record.supervisor.pid = 0;
        let decoded = SnapshotRecord::decode(&record.encode()).unwrap();
        assert!(decoded.supervisor.gave_up);
        assert_eq!(decoded.supervisor.pid, 0);
    }

    #[test]
    fn short_input_is_truncated() {
        let bytes = sample().encode();
        let err = SnapshotRecord::decode(&bytes[..SNAPSHOT_SIZE - 1]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Truncated { expected: SNAPSHOT_SIZE, found } if found == SNAPSHOT_SIZE - 1
        ));
        assert!(matches!(
            SnapshotRecord::decode(&[]),
            Err(StoreError::Truncated { found: 0, .. })
        ));
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(SnapshotRecord::decode(&bytes), Err(StoreError::BadMagic)));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = sample().encode();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            SnapshotRecord::decode(&bytes),
            Err(StoreError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn slot_helpers() {
        assert_eq!(SlotKind::Command.index(), 0);
        assert_eq!(SlotKind::Log.index(), 1);
        let fresh = ChildSlot::new(SlotLimits::default());
        assert!(fresh.never_started());
        assert!(!fresh.is_running());
        assert_eq!(fresh.max_recent_restarts, 3);
        assert_eq!(fresh.recent_window_seconds, 3600);
    }
}
