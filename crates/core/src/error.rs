//! Engine error taxonomy.
//!
//! Every fatal path of a run ends in a [`PipelineError`]. Callers that need
//! the wire shape convert it with [`PipelineError::to_run_error`].

use crate::computation::base::ComputationError;
use dcp_protocol::run_models::RunError;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Code attached to errors raised by a user stop.
pub const STOP_BY_USER: &str = "stop-by-user";

/// Code attached to errors raised by a suspend.
pub const STOP_BY_SUSPEND: &str = "stop-by-suspend";

/// Errors that can end a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A computation unit failed.
    #[error("Computation failed: {source}")]
    Computation {
        source: ComputationError,
        input: Option<Value>,
    },

    /// A file transfer could not be completed.
    #[error("{0}")]
    NetworkTransfer(String),

    /// A message violated the coordination protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Pipeline stopped by user")]
    UserStop,

    #[error("Pipeline suspended")]
    Suspend,

    /// Per-run working directories could not be created.
    #[error("Unable to create pipeline directories: {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Error reported by another node.
    #[error("{0}")]
    Remote(RunError),

    #[error("Invalid pipeline ID {0}")]
    UnknownRun(String),

    #[error("Duplicate pipeline started: {0}")]
    DuplicateRun(String),

    #[error("Invalid pipeline specification: {0}")]
    InvalidSpec(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Message bus error: {0}")]
    Bus(#[from] crate::network::bus::BusError),
}

/// Type alias for Result with PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Convert into the shape reported to callers and peers.
    pub fn to_run_error(&self) -> RunError {
        match self {
            PipelineError::Remote(error) => error.clone(),
            PipelineError::Computation { source, input } => {
                let mut error = RunError::new(self.to_string()).with_code("computation");
                error.stack = source.stderr().map(str::to_string);
                error.input = input.clone();
                error
            }
            PipelineError::UserStop => RunError::new(self.to_string()).with_code(STOP_BY_USER),
            PipelineError::Suspend => RunError::new(self.to_string()).with_code(STOP_BY_SUSPEND),
            PipelineError::NetworkTransfer(_) => {
                RunError::new(self.to_string()).with_code("network-transfer")
            }
            PipelineError::Directory { .. } => {
                RunError::new(self.to_string()).with_code("directory")
            }
            _ => RunError::new(self.to_string()),
        }
    }

    /// Whether the run ended because someone asked it to.
    pub fn is_stop(&self) -> bool {
        matches!(self, PipelineError::UserStop | PipelineError::Suspend)
    }
}

impl From<RunError> for PipelineError {
    fn from(error: RunError) -> Self {
        PipelineError::Remote(error)
    }
}
