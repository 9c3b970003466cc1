//! Computation factory for creating computation units from specifications.

use crate::computation::adapters::{DockerComputation, ProcessComputation};
use crate::computation::base::Computation;
use anyhow::{anyhow, bail, Result};
use dcp_protocol::controller_models::ExecutionMode;
use dcp_protocol::pipeline_models::ComputationSpec;
use std::sync::Arc;

/// Factory for creating computation units based on their declaration.
pub struct ComputationFactory;

impl ComputationFactory {
    /// Create a computation unit for `spec` as executed in `mode`.
    ///
    /// # Arguments
    ///
    /// * `spec` - The computation declaration from the pipeline specification
    /// * `mode` - `Remote` selects the central-node launcher when one is declared
    ///
    /// # Returns
    ///
    /// An `Arc<dyn Computation>` wrapping the appropriate adapter.
    ///
    /// # Behavior
    ///
    /// - `docker` → `DockerComputation` (requires `dockerImage`)
    /// - `process` / `local` → `ProcessComputation`
    /// - anything else is an error
    ///
    /// # Examples
    ///
    /// ```
    /// use dcp_core::computation::ComputationFactory;
    /// use dcp_protocol::controller_models::ExecutionMode;
    /// use dcp_protocol::pipeline_models::ComputationSpec;
    ///
    /// let spec: ComputationSpec = serde_json::from_value(serde_json::json!({
    ///     "meta": { "id": "sum" },
    ///     "computation": { "type": "process", "command": ["python3", "sum.py"] }
    /// }))
    /// .unwrap();
    ///
    /// let computation = ComputationFactory::create(&spec, ExecutionMode::Local).unwrap();
    /// ```
    pub fn create(spec: &ComputationSpec, mode: ExecutionMode) -> Result<Arc<dyn Computation>> {
        let definition = &spec.computation;
        let (kind, image, command) = match (mode, &definition.remote) {
            (ExecutionMode::Remote, Some(remote)) => {
                (&remote.kind, &remote.docker_image, &remote.command)
            }
            _ => (&definition.kind, &definition.docker_image, &definition.command),
        };

        match kind.as_str() {
            "docker" => {
                let image = image.clone().ok_or_else(|| {
                    anyhow!("Computation {} is missing a docker image", spec.meta.id)
                })?;
                Ok(Arc::new(DockerComputation::new(image, command.clone())))
            }
            "process" | "local" => {
                let computation = ProcessComputation::new(command)
                    .map_err(|e| anyhow!("Computation {}: {e}", spec.meta.id))?;
                Ok(Arc::new(computation))
            }
            other => bail!("Unsupported computation type '{other}' for {}", spec.meta.id),
        }
    }
}
