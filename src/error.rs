//! Error taxonomy for a simulation run.
//!
//! Every failure after the parallel runtime is up is funneled into a
//! [`RunError`] and logged once before the worker exits. Runtime init
//! failures never reach this type: they are written straight to stderr.

use std::fmt;

/// Exit status for a run that completed every timestep.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status for any failure reported through logging.
pub const EXIT_FAILURE: i32 = 1;

/// Exit status when the parallel runtime could not start.
pub const EXIT_STARTUP_FAILURE: i32 = 2;

/// Errors that abort a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// The parallel runtime could not be initialized.
    Startup(String),

    /// Missing, unreadable or malformed configuration or input files.
    Configuration(String),

    /// The domain cannot be split across the requested number of workers.
    Partition(String),

    /// Restart state does not match the current partition or configuration.
    Restart(String),

    /// Forcing unavailable, executor failure or output failure mid-run.
    Runtime { timestep: Option<usize>, message: String },

    /// A checkpoint could not be written consistently by every worker.
    Checkpoint { timestep: usize, message: String },

    /// A peer worker failed a collective phase this worker passed.
    PeerAborted { phase: String, ranks: Vec<usize> },

    /// The communicator itself failed (lost peer, poisoned rendezvous).
    Collective(String),
}

/// Result type for run operations.
pub type RunResult<T> = Result<T, RunError>;

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup(msg) => write!(f, "Parallel runtime failed to start: {}", msg),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Partition(msg) => write!(f, "Domain decomposition error: {}", msg),
            Self::Restart(msg) => write!(f, "Restart state error: {}", msg),
            Self::Runtime {
                timestep: Some(t),
                message,
            } => write!(f, "Runtime error at timestep {}: {}", t, message),
            Self::Runtime {
                timestep: None,
                message,
            } => write!(f, "Runtime error: {}", message),
            Self::Checkpoint { timestep, message } => {
                write!(f, "Checkpoint at timestep {} failed: {}", timestep, message)
            }
            Self::PeerAborted { phase, ranks } => {
                write!(f, "Phase '{}' failed on worker(s) {:?}", phase, ranks)
            }
            Self::Collective(msg) => write!(f, "Collective operation failed: {}", msg),
        }
    }
}

impl std::error::Error for RunError {}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        Self::Runtime {
            timestep: None,
            message: format!("{:#}", err),
        }
    }
}

impl RunError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Startup(_) => EXIT_STARTUP_FAILURE,
            _ => EXIT_FAILURE,
        }
    }

    /// Runtime failure tied to a timestep.
    pub fn runtime_at(timestep: usize, err: impl fmt::Display) -> Self {
        Self::Runtime {
            timestep: Some(timestep),
            message: err.to_string(),
        }
    }

    /// Short label for the error class, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Startup(_) => "startup",
            Self::Configuration(_) => "configuration",
            Self::Partition(_) => "partition",
            Self::Restart(_) => "restart",
            Self::Runtime { .. } => "runtime",
            Self::Checkpoint { .. } => "checkpoint",
            Self::PeerAborted { .. } => "peer-aborted",
            Self::Collective(_) => "collective",
        }
    }
}
