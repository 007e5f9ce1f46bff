//! Child process launcher.
//!
//! `fork` + `exec` with the three standard descriptors rewired. Everything
//! the child needs (C strings, the argv pointer array, descriptor numbers)
//! is prepared before forking so that the child only makes
//! async-signal-safe calls between `fork` and `exec`.
//!
//! Descriptors owned by the supervisor (`/dev/null`, the log pipe, the
//! lock and status files) are all close-on-exec, so a child sees exactly
//! stdin, stdout and stderr.

use crate::error::LaunchError;
use fsv_common::config::{CommandSpec, OutputMask, ServiceConfig};
use fsv_common::consts::{EXEC_FAILURE_STATUS, SHELL_PATH};
use fsv_common::snapshot::SlotKind;
use nix::fcntl::OFlag;
use nix::unistd::{ForkResult, Pid, fork, pipe2};
use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::raw::{c_char, c_int};
use std::ptr;
use tracing::debug;

/// An executable program with its argument vector, ready for `execvp`.
#[derive(Debug, Clone)]
pub struct Program {
    path: CString,
    argv: Vec<CString>,
    display: String,
}

impl Program {
    /// Prepare `spec` for execution.
    ///
    /// `Argv` runs the first word through `PATH`; `Shell` runs
    /// `/bin/sh -c "exec <line>"` so the shell is replaced by the command
    /// and the pid we track is the command's own.
    pub fn from_spec(spec: &CommandSpec) -> Result<Self, LaunchError> {
        let (path, words) = match spec {
            CommandSpec::Argv(argv) => {
                let first = argv.first().cloned().unwrap_or_default();
                (first, argv.clone())
            }
            CommandSpec::Shell(line) => (
                SHELL_PATH.to_string(),
                vec!["sh".to_string(), "-c".to_string(), format!("exec {line}")],
            ),
        };
        if path.is_empty() {
            return Err(LaunchError::InvalidArgument { arg: path });
        }

        Ok(Self {
            path: c_string(path)?,
            argv: words.into_iter().map(c_string).collect::<Result<_, _>>()?,
            display: spec.to_string(),
        })
    }

    /// Human readable form for diagnostics.
    pub fn display(&self) -> &str {
        &self.display
    }
}

fn c_string(s: String) -> Result<CString, LaunchError> {
    CString::new(s).map_err(|e| LaunchError::InvalidArgument {
        arg: String::from_utf8_lossy(&e.into_vec()).into_owned(),
    })
}

/// Descriptors that become the child's stdin, stdout and stderr.
#[derive(Debug, Clone, Copy)]
pub struct Stdio<'a> {
    pub stdin: BorrowedFd<'a>,
    pub stdout: BorrowedFd<'a>,
    pub stderr: BorrowedFd<'a>,
}

/// Fork and exec `program` with `stdio` installed as descriptors 0, 1, 2.
///
/// Returns the child's pid. If `exec` fails, the child exits with
/// status 64; that surfaces as an ordinary child exit.
pub fn spawn(program: &Program, stdio: Stdio<'_>) -> Result<Pid, LaunchError> {
    let mut argv: Vec<*const c_char> = program.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());
    let fds = [
        stdio.stdin.as_raw_fd(),
        stdio.stdout.as_raw_fd(),
        stdio.stderr.as_raw_fd(),
    ];

    // SAFETY: the child branch only calls async-signal-safe functions on
    // memory prepared above, then execs or `_exit`s.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => exec_child(&program.path, &argv, fds),
        Err(source) => Err(LaunchError::Fork { source }),
    }
}

/// Runs in the forked child. Never returns.
fn exec_child(path: &CStr, argv: &[*const c_char], mut fds: [RawFd; 3]) -> ! {
    // SAFETY: raw libc calls on valid descriptors and NUL-terminated
    // strings; no allocation or locking happens here.
    unsafe {
        // The supervisor blocks its wake-up signals; the child starts clean.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

        // Move sources out of 0..=2 first so one dup2 cannot clobber the
        // source of the next.
        for fd in fds.iter_mut() {
            if *fd <= 2 {
                let moved = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, 3);
                if moved < 0 {
                    libc::_exit(EXEC_FAILURE_STATUS);
                }
                *fd = moved;
            }
        }
        for (target, fd) in fds.iter().enumerate() {
            if libc::dup2(*fd, target as c_int) < 0 {
                libc::_exit(EXEC_FAILURE_STATUS);
            }
        }

        libc::execvp(path.as_ptr(), argv.as_ptr());
        libc::_exit(EXEC_FAILURE_STATUS)
    }
}

/// Pipe from the command's output to the log process's stdin.
#[derive(Debug)]
struct LogPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl LogPipe {
    fn new() -> Result<Self, LaunchError> {
        let (read, write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|source| LaunchError::Pipe { source })?;
        debug!(
            read = read.as_raw_fd(),
            write = write.as_raw_fd(),
            "log pipe created"
        );
        Ok(Self { read, write })
    }
}

/// Launches the command and log slots of one service.
///
/// The pipe is created on first use and kept for the supervisor's
/// lifetime, so a restarted logger picks up whatever the command wrote
/// while it was down.
#[derive(Debug)]
pub struct ForkExecLauncher {
    command: Program,
    log: Option<Program>,
    output: OutputMask,
    devnull: File,
    pipe: Option<LogPipe>,
}

impl ForkExecLauncher {
    /// Prepare both slots of `config` and open `/dev/null`.
    pub fn new(config: &ServiceConfig) -> Result<Self, LaunchError> {
        let devnull = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(|source| LaunchError::DevNull { source })?;
        Ok(Self {
            command: Program::from_spec(&config.command)?,
            log: config.log.as_ref().map(Program::from_spec).transpose()?,
            output: config.output,
            devnull,
            pipe: None,
        })
    }

    /// Program configured for `slot`, if any.
    pub fn program(&self, slot: SlotKind) -> Option<&Program> {
        match slot {
            SlotKind::Command => Some(&self.command),
            SlotKind::Log => self.log.as_ref(),
        }
    }

    /// Start the child for `slot`.
    pub fn launch(&mut self, slot: SlotKind) -> Result<Pid, LaunchError> {
        if self.program(slot).is_none() {
            return Err(LaunchError::NotConfigured { slot });
        }
        let needs_pipe =
            self.log.is_some() && (slot == SlotKind::Log || !self.output.is_empty());
        if needs_pipe && self.pipe.is_none() {
            self.pipe = Some(LogPipe::new()?);
        }

        let null = self.devnull.as_fd();
        let stdio = match slot {
            SlotKind::Command => {
                let route = |stream: OutputMask| match &self.pipe {
                    Some(pipe) if self.output.contains(stream) => pipe.write.as_fd(),
                    _ => null,
                };
                Stdio {
                    stdin: null,
                    stdout: route(OutputMask::STDOUT),
                    stderr: route(OutputMask::STDERR),
                }
            }
            SlotKind::Log => Stdio {
                stdin: self.pipe.as_ref().map_or(null, |p| p.read.as_fd()),
                stdout: null,
                stderr: null,
            },
        };

        let program = match slot {
            SlotKind::Command => &self.command,
            SlotKind::Log => self
                .log
                .as_ref()
                .ok_or(LaunchError::NotConfigured { slot })?,
        };
        let pid = spawn(program, stdio)?;
        debug!(%slot, pid = pid.as_raw(), program = program.display(), "spawned");
        Ok(pid)
    }
}
