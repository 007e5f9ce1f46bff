//! # fsv
//!
//! Supervise a command, restart it when it dies, and feed its output to a
//! log process. The same binary answers status queries.
//!
//! # Usage
//!
//! ```bash
//! # Keep a server running, logging both streams through a shell pipeline
//! fsv -n web -l 'exec logger -t web' -- ./server --port 8080
//!
//! # Back off 10 s instead of giving up when it crash-loops
//! fsv -t 10 -m 5 -r 60 ./worker
//!
//! # Query
//! fsv --status web
//! fsv --pids web
//! fsv --status web --json
//! ```

use clap::Parser;
use fsv::error::{FsvError, FsvResult};
use fsv::events::{SignalEvents, SlotTimers};
use fsv::host::SystemHost;
use fsv::launcher::ForkExecLauncher;
use fsv::status::StatusReport;
use fsv::supervisor::{ExitReason, Supervisor};
use fsv_common::clock::Timestamp;
use fsv_common::config::{
    ConfigError, ConfigLoader, LimitsFile, LogLevel, OutputMode, ServiceConfig, ServiceFile,
};
use fsv_common::consts::EX_USAGE;
use fsv_common::state_dir::{StateDir, effective_uid, resolve_prefix};
use fsv_common::store::SnapshotStore;
use nix::unistd::{daemon, getpid};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// fsv - restart a command when it exits and route its output to a log process
#[derive(Parser, Debug)]
#[command(name = "fsv")]
#[command(version)]
#[command(about = "Supervise a command: restart it, log its output, publish its status")]
#[command(long_about = None)]
struct Args {
    /// Service name (default: basename of the command)
    #[arg(short, long)]
    name: Option<String>,

    /// Log process, run as `/bin/sh -c "exec CMD"` with the command's output on stdin
    #[arg(short, long, value_name = "CMD")]
    log: Option<String>,

    /// Streams sent to the log process: none, stdout, stderr, both (or 0-3)
    #[arg(short = 'o', long = "output-mask", value_name = "MODE")]
    output: Option<OutputMode>,

    /// Restarts allowed within the recent window before backing off
    #[arg(short = 'm', long = "max-restarts", value_name = "N")]
    max_restarts: Option<u64>,

    /// Length of the recent window in seconds (0 = forever)
    #[arg(short = 'r', long = "recent-secs", value_name = "SECS")]
    recent_secs: Option<u64>,

    /// Restarts allowed for the log process
    #[arg(short = 'M', long = "max-restarts-log", value_name = "N")]
    max_restarts_log: Option<u64>,

    /// Recent window for the log process
    #[arg(short = 'R', long = "recent-secs-log", value_name = "SECS")]
    recent_secs_log: Option<u64>,

    /// Backoff in seconds when restarting too fast (0 = give up)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// TOML file with service settings; flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding `fsv-<uid>/` (default: $FSV_STATE_DIR or /tmp)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Detach and run in the background
    #[arg(short = 'b', long)]
    daemon: bool,

    /// Detach but keep the standard streams open
    #[arg(short = 'B', long, conflicts_with = "daemon")]
    daemon_keep_stderr: bool,

    /// Print the status of service NAME and exit
    #[arg(short, long, value_name = "NAME", conflicts_with = "pids")]
    status: Option<String>,

    /// Print the supervisor, command and log pids of service NAME and exit
    #[arg(short, long, value_name = "NAME")]
    pids: Option<String>,

    /// Query a service owned by another user
    #[arg(short, long, value_name = "UID")]
    uid: Option<u32>,

    /// JSON status output / JSON diagnostics
    #[arg(long)]
    json: bool,

    /// Shorthand for `--loglevel debug`
    #[arg(short, long)]
    debug: bool,

    /// Diagnostics level: trace, debug, info, warn, error
    #[arg(short = 'L', long, value_name = "LEVEL")]
    loglevel: Option<LogLevel>,

    /// Command to supervise, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Args {
    fn log_level(&self) -> Option<LogLevel> {
        if self.debug {
            Some(LogLevel::Debug)
        } else {
            self.loglevel
        }
    }

    /// Settings given on the command line, as the topmost layer.
    fn service_layer(&self) -> ServiceFile {
        ServiceFile {
            name: self.name.clone(),
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            log: self.log.clone(),
            output: self.output,
            timeout_secs: self.timeout,
            log_level: self.log_level(),
            command_limits: LimitsFile {
                max_recent_restarts: self.max_restarts,
                recent_window_secs: self.recent_secs,
            },
            log_limits: LimitsFile {
                max_recent_restarts: self.max_restarts_log,
                recent_window_secs: self.recent_secs_log,
            },
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { EX_USAGE } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    let code = match (&args.status, &args.pids) {
        (Some(name), _) => {
            setup_tracing(args.log_level().unwrap_or_default(), false);
            query(&args, name, false)
        }
        (None, Some(name)) => {
            setup_tracing(args.log_level().unwrap_or_default(), false);
            query(&args, name, true)
        }
        (None, None) => match build_config(&args) {
            Ok(config) => {
                setup_tracing(config.log_level, args.json);
                match run(&args, config) {
                    Ok(reason) => {
                        info!(?reason, "supervisor exiting");
                        0
                    }
                    Err(e) => {
                        error!("fsv failed: {e}");
                        exit_code(&e)
                    }
                }
            }
            Err(e) => {
                setup_tracing(args.log_level().unwrap_or_default(), args.json);
                error!("invalid configuration: {e}");
                EX_USAGE
            }
        },
    };
    process::exit(code);
}

fn exit_code(e: &FsvError) -> i32 {
    match e {
        FsvError::Config(_) => EX_USAGE,
        _ => 1,
    }
}

/// Merge the optional config file under the command line flags.
fn build_config(args: &Args) -> Result<ServiceConfig, ConfigError> {
    let file = match &args.config {
        Some(path) => ServiceFile::load(path)?,
        None => ServiceFile::default(),
    };
    ServiceConfig::try_from(file.merge(args.service_layer()))
}

fn run(args: &Args, config: ServiceConfig) -> FsvResult<ExitReason> {
    let prefix = resolve_prefix(args.state_dir.as_deref());
    let dir = StateDir::create(&prefix, &config.name)?;
    let _lock = dir.lock()?;
    let store = SnapshotStore::create(&dir.snapshot_path())?;
    info!(
        name = %config.name,
        dir = %dir.path().display(),
        command = %config.command,
        "fsv v{} supervising",
        env!("CARGO_PKG_VERSION")
    );

    if args.daemon || args.daemon_keep_stderr {
        daemon(false, args.daemon_keep_stderr).map_err(FsvError::system("cannot daemonize"))?;
    }

    // Signals are blocked before the first fork so no SIGCHLD is lost.
    let mut events = SignalEvents::install()?;
    let host = SystemHost::new(ForkExecLauncher::new(&config)?, SlotTimers::new()?);
    let mut supervisor = Supervisor::new(
        &config,
        host,
        store,
        getpid().as_raw(),
        Timestamp::realtime(),
    );
    supervisor.run(&mut events)
}

/// `--status` / `--pids`: print and return the query exit code.
fn query(args: &Args, name: &str, pids_only: bool) -> i32 {
    let prefix = resolve_prefix(args.state_dir.as_deref());
    let uid = args.uid.unwrap_or_else(effective_uid);
    let report = match StatusReport::load(&prefix, uid, name) {
        Ok(report) => report,
        Err(e) => {
            error!("{name}: {e}");
            return 1;
        }
    };

    let rendered = if args.json {
        report.render_json()
    } else if pids_only {
        Ok(report.render_pids())
    } else {
        Ok(report.render_text(Timestamp::monotonic()))
    };
    match rendered {
        Ok(text) => {
            print!("{text}");
            if args.json {
                println!();
            }
            report.exit_code()
        }
        Err(e) => {
            error!("{name}: {e}");
            1
        }
    }
}

/// Setup tracing subscriber; diagnostics always go to stderr.
fn setup_tracing(level: LogLevel, json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(level.as_level().into());

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
