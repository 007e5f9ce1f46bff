//! Per-service state directory and its lockfile.
//!
//! Layout: `<prefix>/fsv-<euid>/<name>/{lock,info.struct}`. The prefix is a
//! tmp-like shared directory, so the per-user directory is only used when
//! it is owned by the current user.
//!
//! The supervisor holds an exclusive `flock(2)` on `lock` for its whole
//! lifetime; that is what keeps two supervisors for the same name apart and
//! what the status tool probes to tell a live supervisor from a stale file.
//! The lockfile is world-readable: `flock` only needs a read descriptor, so
//! `--uid` queries from other users can probe it.

use crate::config::{ConfigError, validate_service_name};
use crate::consts::{DEFAULT_STATE_PREFIX, LOCK_FILE, SNAPSHOT_FILE, STATE_PREFIX_ENV};
use std::fs::{DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors preparing or opening a state directory.
#[derive(Error, Debug)]
pub enum StateDirError {
    /// Filesystem error on `path`.
    #[error("cannot access {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Source IO error
        source: io::Error,
    },

    /// The per-user directory belongs to somebody else.
    #[error("unexpected owner of {}: uid {owner}, expected {expected}", path.display())]
    WrongOwner {
        /// Offending path
        path: PathBuf,
        /// Actual owner
        owner: u32,
        /// Effective uid of this process
        expected: u32,
    },

    /// Another supervisor holds the lock.
    #[error("{} is locked (already running?)", path.display())]
    AlreadyRunning {
        /// Lockfile path
        path: PathBuf,
    },

    /// Service name unusable as a directory name.
    #[error(transparent)]
    InvalidName(#[from] ConfigError),
}

/// Result type for state directory operations
pub type StateDirResult<T> = Result<T, StateDirError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StateDirError + '_ {
    move |source| StateDirError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Pick the state prefix: explicit value, then `FSV_STATE_DIR`, then `/tmp`.
pub fn resolve_prefix(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    match std::env::var_os(STATE_PREFIX_ENV) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(DEFAULT_STATE_PREFIX),
    }
}

/// Current effective uid.
pub fn effective_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// A service's state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

/// Mode of the lockfile, readable by the status tool of any user.
const LOCK_FILE_MODE: u32 = 0o644;

/// Held exclusive lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
}

impl StateDir {
    /// Create (if needed) and return the directory for service `name`
    /// owned by the effective user.
    pub fn create(prefix: &Path, name: &str) -> StateDirResult<Self> {
        validate_service_name(name)?;
        let euid = effective_uid();
        let user_dir = prefix.join(format!("fsv-{euid}"));

        match DirBuilder::new().mode(0o755).create(&user_dir) {
            Ok(()) => debug!("created {}", user_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_err(&user_dir)(e)),
        }

        // Do not follow a symlink planted in a shared prefix.
        let meta = std::fs::symlink_metadata(&user_dir).map_err(io_err(&user_dir))?;
        if !meta.is_dir() || meta.uid() != euid {
            return Err(StateDirError::WrongOwner {
                path: user_dir,
                owner: meta.uid(),
                expected: euid,
            });
        }

        let root = user_dir.join(name);
        match DirBuilder::new().mode(0o755).create(&root) {
            Ok(()) => debug!("created {}", root.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_err(&root)(e)),
        }
        let root = root.canonicalize().map_err(io_err(&root))?;

        Ok(Self { root })
    }

    /// Locate an existing directory for service `name` of user `uid`
    /// without creating anything.
    pub fn open(prefix: &Path, uid: u32, name: &str) -> StateDirResult<Self> {
        validate_service_name(name)?;
        let root = prefix.join(format!("fsv-{uid}")).join(name);
        let meta = std::fs::metadata(&root).map_err(io_err(&root))?;
        if !meta.is_dir() {
            return Err(io_err(&root)(io::Error::new(
                io::ErrorKind::NotFound,
                "not a directory",
            )));
        }
        Ok(Self { root })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of the status snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    /// Path of the lockfile.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Take the exclusive lock without blocking.
    pub fn lock(&self) -> StateDirResult<LockGuard> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(&path)
            .map_err(io_err(&path))?;

        if try_flock(&file).map_err(io_err(&path))? {
            // Not subject to the umask; also repairs files left by older runs.
            file.set_permissions(Permissions::from_mode(LOCK_FILE_MODE))
                .map_err(io_err(&path))?;
            Ok(LockGuard { _file: file })
        } else {
            Err(StateDirError::AlreadyRunning { path })
        }
    }

    /// `true` if some process currently holds the lock.
    ///
    /// A lock acquired by the probe itself is released immediately.
    pub fn probe_lock(&self) -> StateDirResult<bool> {
        let path = self.lock_path();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let acquired = try_flock(&file).map_err(io_err(&path))?;
        if acquired {
            // SAFETY: fd is valid for the lifetime of `file`.
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        }
        Ok(!acquired)
    }
}

/// Non-blocking `LOCK_EX`; `Ok(false)` if someone else holds it.
fn try_flock(file: &File) -> io::Result<bool> {
    // SAFETY: fd is valid for the lifetime of `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}
