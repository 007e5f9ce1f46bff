//! Configuration surface consumed by the supervisor.
//!
//! Settings come from three layers: built-in defaults, an optional TOML
//! file, and command-line flags. Each layer is a [`ServiceFile`] with every
//! field optional; layers are merged with [`ServiceFile::merge`] and turned
//! into a validated [`ServiceConfig`] with `ServiceConfig::try_from`.
//!
//! # TOML Example
//!
//! ```toml
//! name = "web"
//! command = ["/usr/local/bin/web", "--port", "8080"]
//! log = "logger -t web"
//! output = "both"
//! timeout_secs = 30
//! log_level = "debug"
//!
//! [command_limits]
//! max_recent_restarts = 5
//! recent_window_secs = 600
//!
//! [log_limits]
//! max_recent_restarts = 1
//! ```

use crate::consts::{DEFAULT_MAX_RECENT_RESTARTS, DEFAULT_RECENT_WINDOW_SECS, DEFAULT_TIMEOUT_SECS};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for the supervisor's own diagnostics.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Every wake-up of the supervision loop.
    Debug,
    /// Launches and exits.
    #[default]
    Info,
    /// Give-up, backoff and persistence failures.
    Warn,
    /// Fatal problems only.
    Error,
}

impl LogLevel {
    /// Matching `tracing` level, used as the default filter directive.
    pub const fn as_level(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // syslog-style names are accepted for compatibility with old scripts.
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "notice" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" | "crit" | "alert" | "emerg" => Ok(LogLevel::Error),
            other => Err(ConfigError::ValidationError(format!(
                "unrecognized log level `{other}`"
            ))),
        }
    }
}

bitflags! {
    /// Which of the command's output streams are fed into the log pipe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputMask: u8 {
        /// Command stdout goes to the log process.
        const STDOUT = 1;
        /// Command stderr goes to the log process.
        const STDERR = 2;
    }
}

/// Output routing mode as written by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Nothing is sent to the log process.
    None,
    /// Only stdout.
    Stdout,
    /// Only stderr.
    Stderr,
    /// stdout and stderr share the pipe.
    #[default]
    Both,
}

impl OutputMode {
    /// Bit mask used by the launcher.
    pub const fn mask(self) -> OutputMask {
        match self {
            OutputMode::None => OutputMask::empty(),
            OutputMode::Stdout => OutputMask::STDOUT,
            OutputMode::Stderr => OutputMask::STDERR,
            OutputMode::Both => OutputMask::STDOUT.union(OutputMask::STDERR),
        }
    }
}

impl FromStr for OutputMode {
    type Err = ConfigError;

    /// Accepts the mode names and the numeric masks `0`-`3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "0" => Ok(OutputMode::None),
            "stdout" | "1" => Ok(OutputMode::Stdout),
            "stderr" | "2" => Ok(OutputMode::Stderr),
            "both" | "3" => Ok(OutputMode::Both),
            other => Err(ConfigError::ValidationError(format!(
                "output mode must be none, stdout, stderr, both or 0-3, got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputMode::None => "none",
            OutputMode::Stdout => "stdout",
            OutputMode::Stderr => "stderr",
            OutputMode::Both => "both",
        };
        f.write_str(s)
    }
}

/// Crash-loop limits for one child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLimits {
    /// Restarts allowed inside the window before the policy steps in.
    /// 0 makes the very first restart hit the limit.
    pub max_recent_restarts: u64,
    /// Width of the recent window; 0 means restarts never age out.
    pub recent_window_secs: u64,
}

impl Default for SlotLimits {
    fn default() -> Self {
        Self {
            max_recent_restarts: DEFAULT_MAX_RECENT_RESTARTS,
            recent_window_secs: DEFAULT_RECENT_WINDOW_SECS,
        }
    }
}

/// What to execute for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Program and arguments, resolved through `PATH`.
    Argv(Vec<String>),
    /// A command line handed to `/bin/sh -c "exec ..."`.
    Shell(String),
}

impl CommandSpec {
    /// `true` if there is nothing to run.
    pub fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Argv(argv) => argv.first().is_none_or(|p| p.is_empty()),
            CommandSpec::Shell(line) => line.trim().is_empty(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Argv(argv) => f.write_str(&argv.join(" ")),
            CommandSpec::Shell(line) => f.write_str(line),
        }
    }
}

/// Optional limits as they appear in a file or on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsFile {
    /// See [`SlotLimits::max_recent_restarts`].
    pub max_recent_restarts: Option<u64>,
    /// See [`SlotLimits::recent_window_secs`].
    pub recent_window_secs: Option<u64>,
}

impl LimitsFile {
    fn merge(self, over: LimitsFile) -> LimitsFile {
        LimitsFile {
            max_recent_restarts: over.max_recent_restarts.or(self.max_recent_restarts),
            recent_window_secs: over.recent_window_secs.or(self.recent_window_secs),
        }
    }

    fn resolve(self) -> SlotLimits {
        let d = SlotLimits::default();
        SlotLimits {
            max_recent_restarts: self.max_recent_restarts.unwrap_or(d.max_recent_restarts),
            recent_window_secs: self.recent_window_secs.unwrap_or(d.recent_window_secs),
        }
    }
}

/// One layer of service settings, every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFile {
    /// Service name; defaults to the basename of the command.
    pub name: Option<String>,
    /// Program and arguments.
    pub command: Option<Vec<String>>,
    /// Log process command line (shell syntax).
    pub log: Option<String>,
    /// Which command streams feed the log process.
    pub output: Option<OutputMode>,
    /// Backoff in seconds; 0 gives up instead.
    pub timeout_secs: Option<u64>,
    /// Supervisor diagnostics level.
    pub log_level: Option<LogLevel>,
    /// Limits for the command slot.
    #[serde(default)]
    pub command_limits: LimitsFile,
    /// Limits for the log slot.
    #[serde(default)]
    pub log_limits: LimitsFile,
}

impl ServiceFile {
    /// Overlay `over` on top of `self`; values present in `over` win.
    pub fn merge(self, over: ServiceFile) -> ServiceFile {
        ServiceFile {
            name: over.name.or(self.name),
            command: over.command.filter(|c| !c.is_empty()).or(self.command),
            log: over.log.or(self.log),
            output: over.output.or(self.output),
            timeout_secs: over.timeout_secs.or(self.timeout_secs),
            log_level: over.log_level.or(self.log_level),
            command_limits: self.command_limits.merge(over.command_limits),
            log_limits: self.log_limits.merge(over.log_limits),
        }
    }
}

/// Fully resolved settings for one supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service name, used as the state directory name.
    pub name: String,
    /// The supervised command.
    pub command: CommandSpec,
    /// Optional log process; `None` disables the log slot.
    pub log: Option<CommandSpec>,
    /// Command streams routed into the log process.
    pub output: OutputMask,
    /// Backoff duration in seconds; 0 = give up.
    pub timeout_secs: u64,
    /// Limits for the command slot.
    pub command_limits: SlotLimits,
    /// Limits for the log slot.
    pub log_limits: SlotLimits,
    /// Supervisor diagnostics level.
    pub log_level: LogLevel,
}

impl ServiceConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - the command is empty
    /// - the name is empty, starts with `.` or `/`, or contains `/`
    /// - output routing is requested without a log command
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::ValidationError(
                "no command to execute".to_string(),
            ));
        }
        validate_service_name(&self.name)?;
        if let Some(log) = &self.log {
            if log.is_empty() {
                return Err(ConfigError::ValidationError(
                    "log command cannot be empty".to_string(),
                ));
            }
        } else if !self.output.is_empty() {
            return Err(ConfigError::ValidationError(
                "output routing requires a log command".to_string(),
            ));
        }
        Ok(())
    }

    /// `true` if a log process is configured.
    pub fn logging_enabled(&self) -> bool {
        self.log.is_some()
    }
}

impl TryFrom<ServiceFile> for ServiceConfig {
    type Error = ConfigError;

    fn try_from(file: ServiceFile) -> Result<Self, Self::Error> {
        let argv = file.command.unwrap_or_default();
        let name = match file.name {
            Some(name) => name,
            None => argv
                .first()
                .map(|a| default_service_name(a))
                .unwrap_or_default(),
        };
        let log = file.log.map(CommandSpec::Shell);
        let output = match (file.output, &log) {
            (Some(mode), _) => mode.mask(),
            (None, Some(_)) => OutputMode::Both.mask(),
            (None, None) => OutputMask::empty(),
        };

        let config = ServiceConfig {
            name,
            command: CommandSpec::Argv(argv),
            log,
            output,
            timeout_secs: file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            command_limits: file.command_limits.resolve(),
            log_limits: file.log_limits.resolve(),
            log_level: file.log_level.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Basename of the command, used when no explicit name is given.
pub fn default_service_name(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(argv0)
        .to_string()
}

/// Check that `name` can be used as a single path component.
pub fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::ValidationError(
            "service name cannot be empty".to_string(),
        ));
    }
    if name.starts_with('.') || name.contains('/') {
        return Err(ConfigError::ValidationError(format!(
            "service name `{name}` does not make sense"
        )));
    }
    Ok(())
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
