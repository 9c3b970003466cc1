//! Base Computation trait and supporting types.
//!
//! A computation unit is one containerized (or plain process) step
//! invocation. The engine hands it `{input, cache, state}` and gets back
//! `{output, cache, success}`.

use crate::state::run::RunDirectories;
use async_trait::async_trait;
use dcp_protocol::controller_models::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Context information passed to computations during execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,

    /// Participant executing the computation.
    pub participant_id: String,

    pub mode: ExecutionMode,

    /// Iteration the invocation belongs to.
    pub iteration: u64,

    pub directories: RunDirectories,

    /// Directory holding the participant's input data. Defaults to the run's
    /// base directory.
    pub input_directory: PathBuf,
}

impl ExecutionContext {
    /// Create a new ExecutionContext reading input from the base directory.
    pub fn new(
        run_id: impl Into<String>,
        participant_id: impl Into<String>,
        mode: ExecutionMode,
        directories: RunDirectories,
    ) -> Self {
        let input_directory = directories.base.clone();
        Self {
            run_id: run_id.into(),
            participant_id: participant_id.into(),
            mode,
            iteration: 0,
            directories,
            input_directory,
        }
    }

    /// Set the iteration.
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = iteration;
        self
    }

    /// Read input data from somewhere other than the base directory.
    pub fn with_input_directory(mut self, path: PathBuf) -> Self {
        self.input_directory = path;
        self
    }
}

/// Document handed to a computation unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationRequest {
    pub input: Value,
    pub cache: BTreeMap<String, Value>,
    pub state: ComputationStateInfo,
}

/// Run facts visible to the computation unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationStateInfo {
    pub base_directory: String,
    pub output_directory: String,
    pub transfer_directory: String,
    pub client_id: String,
    pub iteration: u64,
}

impl ComputationRequest {
    pub fn new(input: Value, cache: BTreeMap<String, Value>, context: &ExecutionContext) -> Self {
        Self {
            input,
            cache,
            state: ComputationStateInfo {
                base_directory: context.input_directory.display().to_string(),
                output_directory: context.directories.output.display().to_string(),
                transfer_directory: context.directories.transfer.display().to_string(),
                client_id: context.participant_id.clone(),
                iteration: context.iteration,
            },
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComputationOutput {
    pub output: Value,

    /// Values to carry into the next invocation of the same step.
    #[serde(default)]
    pub cache: BTreeMap<String, Value>,

    /// Whether the computation has converged.
    #[serde(default)]
    pub success: bool,
}

impl ComputationOutput {
    pub fn new(output: Value, success: bool) -> Self {
        Self {
            output,
            cache: BTreeMap::new(),
            success,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputationError {
    #[error("Computation not available: {0}")]
    NotAvailable(String),
    #[error("Execution failed: {0}")]
    ExecutionError(String),
    #[error("Computation exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("Output parsing error: {0}")]
    OutputParseError(String),
    #[error("Computation stopped")]
    Stopped,
}

impl ComputationError {
    /// Captured standard error of a failed process, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ComputationError::Exited { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Computation: Send + Sync {
    async fn check_availability(&self) -> bool;

    /// Run one invocation to completion.
    async fn start(
        &self,
        request: ComputationRequest,
        context: &ExecutionContext,
    ) -> Result<ComputationOutput, ComputationError>;

    /// Abort the invocation in flight, if any.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    struct EchoComputation {
        available: bool,
    }

    #[async_trait]
    impl Computation for EchoComputation {
        async fn check_availability(&self) -> bool {
            self.available
        }

        async fn start(
            &self,
            request: ComputationRequest,
            _context: &ExecutionContext,
        ) -> Result<ComputationOutput, ComputationError> {
            if !self.available {
                return Err(ComputationError::NotAvailable("echo".to_string()));
            }
            Ok(ComputationOutput::new(request.input, true))
        }

        async fn stop(&self) {}
    }

    fn create_test_context() -> ExecutionContext {
        ExecutionContext::new(
            "run-1",
            "site-a",
            ExecutionMode::Local,
            RunDirectories::for_participant(Path::new("/work"), "site-a", "run-1"),
        )
    }

    #[tokio::test]
    async fn test_computation_start() {
        let computation = EchoComputation { available: true };
        let context = create_test_context();
        let request = ComputationRequest::new(json!({ "x": 1 }), BTreeMap::new(), &context);

        let output = computation.start(request, &context).await.unwrap();
        assert_eq!(output.output, json!({ "x": 1 }));
        assert!(output.success);
    }

    #[tokio::test]
    async fn test_computation_unavailable() {
        let computation = EchoComputation { available: false };
        assert!(!computation.check_availability().await);

        let context = create_test_context();
        let request = ComputationRequest::new(Value::Null, BTreeMap::new(), &context);
        let result = computation.start(request, &context).await;
        assert!(matches!(result, Err(ComputationError::NotAvailable(_))));
    }

    #[test]
    fn test_request_state_reflects_context() {
        let context = create_test_context()
            .with_iteration(3)
            .with_input_directory(PathBuf::from("/data/site-a"));
        let request = ComputationRequest::new(Value::Null, BTreeMap::new(), &context);

        assert_eq!(request.state.iteration, 3);
        assert_eq!(request.state.client_id, "site-a");
        assert_eq!(request.state.base_directory, "/data/site-a");
        assert!(request.state.transfer_directory.ends_with("transfer/site-a/run-1"));

        let json = serde_json::to_value(&request).unwrap();
        assert!(json["state"].get("outputDirectory").is_some());
    }

    #[test]
    fn test_output_defaults() {
        let output: ComputationOutput = serde_json::from_value(json!({ "output": 5 })).unwrap();
        assert!(!output.success);
        assert!(output.cache.is_empty());
    }
}
