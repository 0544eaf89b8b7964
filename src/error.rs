//! Error taxonomy for the orchestrator and the exit codes each error maps to

use std::io;
use thiserror::Error;

/// Exit code for invalid configuration (sysexits `EX_CONFIG`)
pub const EXIT_CONFIG: i32 = 78;
/// Exit code for a failure that carries no status of its own
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a stage killed by its timeout (matches coreutils `timeout`)
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code when a program exists but cannot be executed
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit code when a program cannot be found
pub const EXIT_NOT_FOUND: i32 = 127;
/// Base added to a signal number when a process dies from that signal
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Configuration errors. All of them abort before any stage runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set to a value that cannot be used
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read project file {path}: {reason}")]
    ReadFile { path: String, reason: String },

    #[error("failed to parse project file {path}: {reason}")]
    Parse { path: String, reason: String },

    /// A command line in the project file is empty or badly quoted
    #[error("invalid command for '{field}': {reason}")]
    InvalidCommand { field: String, reason: String },

    /// A directory the selected profile depends on does not exist
    #[error("required directory not found: {0}")]
    MissingDirectory(String),

    /// The stage list breaks an ordering rule
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        EXIT_CONFIG
    }
}

/// Why a single stage did not complete
#[derive(Error, Debug)]
pub enum StageError {
    /// The child ran and exited non-zero
    #[error("exited with status {code}")]
    Exited { code: i32 },

    /// The child was killed by a signal it did not handle
    #[error("terminated by signal {signal}")]
    Signaled { signal: i32 },

    /// The orchestrator received a signal while the stage was running
    #[error("interrupted by signal {signal}")]
    Interrupted { signal: i32 },

    #[error("timed out after {secs}s")]
    TimedOut { secs: u64 },

    /// The program could not be started at all
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for child process: {0}")]
    Wait(#[source] io::Error),

    /// A built-in action (cleanup or publish) failed
    #[error("{0}")]
    Action(String),
}

impl StageError {
    /// The process exit code this failure is reported with
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::Exited { code } => *code,
            StageError::Signaled { signal } | StageError::Interrupted { signal } => {
                EXIT_SIGNAL_BASE + signal
            }
            StageError::TimedOut { .. } => EXIT_TIMEOUT,
            StageError::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => EXIT_NOT_FOUND,
                io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
                _ => EXIT_FAILURE,
            },
            StageError::Wait(_) | StageError::Action(_) => EXIT_FAILURE,
        }
    }

    /// Whether the failure happened before the program ever ran
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, StageError::Spawn { .. })
    }
}
