//! Computation unit launched as a docker container.
//!
//! The run's directories are bind-mounted into the container:
//!
//! | Host                          | Container   |
//! |-------------------------------|-------------|
//! | input (base) directory        | `/input`    |
//! | output directory              | `/output`   |
//! | transfer directory            | `/transfer` |
//!
//! The request's directory fields are rewritten to the container paths.

use crate::computation::base::{
    Computation, ComputationError, ComputationOutput, ComputationRequest, ExecutionContext,
};
use crate::computation::executor::ProcessExecutor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

const DOCKER: &str = "docker";

pub struct DockerComputation {
    image: String,
    command: Vec<String>,
    stop: Arc<Notify>,
    container: Mutex<Option<String>>,
}

impl DockerComputation {
    pub fn new(image: String, command: Vec<String>) -> Self {
        Self {
            image,
            command,
            stop: Arc::new(Notify::new()),
            container: Mutex::new(None),
        }
    }

    fn run_args(&self, name: &str, context: &ExecutionContext) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:/input", context.input_directory.display()),
            "-v".to_string(),
            format!("{}:/output", context.directories.output.display()),
            "-v".to_string(),
            format!("{}:/transfer", context.directories.transfer.display()),
            self.image.clone(),
        ];
        args.extend(self.command.iter().cloned());
        args
    }
}

#[async_trait]
impl Computation for DockerComputation {
    async fn check_availability(&self) -> bool {
        which::which(DOCKER).is_ok()
    }

    async fn start(
        &self,
        mut request: ComputationRequest,
        context: &ExecutionContext,
    ) -> Result<ComputationOutput, ComputationError> {
        request.state.base_directory = "/input".to_string();
        request.state.output_directory = "/output".to_string();
        request.state.transfer_directory = "/transfer".to_string();

        let payload = serde_json::to_vec(&request)
            .map_err(|e| ComputationError::ExecutionError(format!("Failed to encode request: {e}")))?;

        let name = format!("dcp-{}-{}", context.participant_id, Uuid::new_v4());
        *self.container.lock() = Some(name.clone());
        debug!(run_id = %context.run_id, image = %self.image, container = %name, "starting container");

        let stream = ProcessExecutor::execute(
            DOCKER.to_string(),
            self.run_args(&name, context),
            context.directories.base.clone(),
            payload,
            Arc::clone(&self.stop),
        );
        let result = ProcessExecutor::collect_output(stream).await;
        self.container.lock().take();
        result
    }

    async fn stop(&self) {
        self.stop.notify_one();
        let name = self.container.lock().take();
        if let Some(name) = name {
            // Killing the docker client leaves the container running.
            if let Err(e) = Command::new(DOCKER).args(["kill", &name]).output().await {
                warn!(container = %name, "failed to kill container: {e}");
            }
        }
    }
}
