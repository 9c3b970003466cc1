//! Computation unit launched as a plain local process.

use crate::computation::base::{
    Computation, ComputationError, ComputationOutput, ComputationRequest, ExecutionContext,
};
use crate::computation::executor::ProcessExecutor;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Runs `command[0] command[1..]` with the request on stdin.
pub struct ProcessComputation {
    program: String,
    args: Vec<String>,
    stop: Arc<Notify>,
}

impl ProcessComputation {
    /// Create a new process computation.
    ///
    /// # Arguments
    ///
    /// * `command` - Program followed by its arguments
    ///
    /// # Errors
    ///
    /// Returns `ComputationError::NotAvailable` when `command` is empty.
    pub fn new(command: &[String]) -> Result<Self, ComputationError> {
        let (program, args) = command.split_first().ok_or_else(|| {
            ComputationError::NotAvailable("Process computation has an empty command".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            stop: Arc::new(Notify::new()),
        })
    }
}

#[async_trait]
impl Computation for ProcessComputation {
    async fn check_availability(&self) -> bool {
        which::which(&self.program).is_ok() || Path::new(&self.program).is_file()
    }

    async fn start(
        &self,
        request: ComputationRequest,
        context: &ExecutionContext,
    ) -> Result<ComputationOutput, ComputationError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ComputationError::ExecutionError(format!("Failed to encode request: {e}")))?;

        debug!(
            run_id = %context.run_id,
            iteration = context.iteration,
            program = %self.program,
            "starting process computation"
        );

        let stream = ProcessExecutor::execute(
            self.program.clone(),
            self.args.clone(),
            context.directories.base.clone(),
            payload,
            Arc::clone(&self.stop),
        );
        ProcessExecutor::collect_output(stream).await
    }

    async fn stop(&self) {
        self.stop.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run::RunDirectories;
    use dcp_protocol::controller_models::ExecutionMode;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(
            ProcessComputation::new(&[]),
            Err(ComputationError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_process_computation_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directories = RunDirectories::for_participant(temp_dir.path(), "site-a", "run-1");
        std::fs::create_dir_all(&directories.base).unwrap();

        // Echo the input back as the output and report convergence.
        let script = r#"read line; printf '{"output":%s,"success":true}\n' "$line""#;
        let computation = ProcessComputation::new(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
        .unwrap();
        assert!(computation.check_availability().await);

        let context =
            ExecutionContext::new("run-1", "site-a", ExecutionMode::Local, directories);
        let request = ComputationRequest::new(json!({ "start": 1 }), BTreeMap::new(), &context);

        let output = computation.start(request, &context).await.unwrap();
        assert!(output.success);
        assert_eq!(output.output["input"], json!({ "start": 1 }));
        assert_eq!(output.output["state"]["clientId"], "site-a");
    }
}
