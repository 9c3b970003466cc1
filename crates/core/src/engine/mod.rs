//! Pipeline execution engine.
//!
//! A [`Pipeline`] chains one [`Controller`] per step. It resolves each
//! step's input from literals and cached outputs of earlier steps, runs the
//! controller to completion and keeps the variables later steps ask for.

pub mod control_box;
pub mod controller;

use crate::computation::base::ExecutionContext;
use crate::computation::registry::ComputationRegistry;
use crate::error::{PipelineError, PipelineResult};
use crate::state::run::{clear_directory, RunDirectories};
use crate::state::store::{RunStore, StoreValue};
use controller::{
    Controller, ControllerHandle, ControllerOptions, ControllerUpdate, RemoteHandler,
};
use dcp_protocol::controller_models::{ControllerState, ExecutionMode};
use dcp_protocol::pipeline_models::{ControllerType, InputSource, PipelineSpec, StepSpec};
use dcp_protocol::run_models::SuspendedRun;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Everything needed to build a pipeline for one participant.
pub struct PipelineOptions {
    pub run_id: String,
    pub participant_id: String,
    pub mode: ExecutionMode,
    pub directories: RunDirectories,
    /// Read input data from here instead of the base directory.
    pub input_directory: Option<PathBuf>,
    pub store: RunStore,
    pub registry: ComputationRegistry,
    pub updates: Option<mpsc::UnboundedSender<ControllerUpdate>>,
    /// Token of a previous suspend to continue from.
    pub resume: Option<SuspendedRun>,
}

/// Shared read-only view of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    current_step: Arc<AtomicUsize>,
    controllers: Arc<Vec<ControllerHandle>>,
    cache: Arc<Mutex<BTreeMap<usize, Value>>>,
}

impl PipelineHandle {
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.controllers.len()
    }

    /// Handle of the controller currently running.
    pub fn current_controller(&self) -> Option<&ControllerHandle> {
        self.controllers.get(self.current_step())
    }

    pub fn controller_state(&self) -> ControllerState {
        self.current_controller()
            .map(ControllerHandle::snapshot)
            .unwrap_or_default()
    }

    pub fn current_iteration(&self) -> u64 {
        self.current_controller()
            .map(ControllerHandle::iteration)
            .unwrap_or(0)
    }

    /// Variables kept from completed steps.
    pub fn cache(&self) -> BTreeMap<usize, Value> {
        self.cache.lock().clone()
    }
}

/// An ordered chain of step controllers.
pub struct Pipeline {
    run_id: String,
    steps: Vec<StepSpec>,
    controllers: Vec<Controller>,
    cached_variables: BTreeMap<usize, BTreeSet<String>>,
    directories: RunDirectories,
    handle: PipelineHandle,
}

impl Pipeline {
    /// Build controllers for every step of `spec`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for empty pipelines, steps without a computation
    /// and cache references that do not point at an earlier step, and
    /// `Computation` if a step's unit cannot be resolved.
    pub fn create(spec: &PipelineSpec, options: PipelineOptions) -> PipelineResult<Self> {
        validate(spec)?;

        let mut controllers = Vec::with_capacity(spec.steps.len());
        for (index, step) in spec.steps.iter().enumerate() {
            let Some(computation_spec) = step.computations.first() else {
                return Err(PipelineError::InvalidSpec(format!(
                    "Step {index} declares no computation"
                )));
            };
            let computation = options
                .registry
                .resolve(computation_spec, options.mode)
                .map_err(|source| PipelineError::Computation {
                    source,
                    input: None,
                })?;

            let mut context = ExecutionContext::new(
                options.run_id.clone(),
                options.participant_id.clone(),
                options.mode,
                options.directories.clone(),
            );
            if let Some(path) = &options.input_directory {
                context = context.with_input_directory(path.clone());
            }

            controllers.push(Controller::new(ControllerOptions {
                step: index,
                controller_type: step.controller.controller_type,
                computation,
                context,
                store: options.store.clone(),
                updates: options.updates.clone(),
            }));
        }

        let handle = PipelineHandle {
            current_step: Arc::new(AtomicUsize::new(0)),
            controllers: Arc::new(controllers.iter().map(Controller::handle).collect()),
            cache: Arc::new(Mutex::new(BTreeMap::new())),
        };

        let mut pipeline = Self {
            run_id: options.run_id,
            steps: spec.steps.clone(),
            controllers,
            cached_variables: spec.cached_variables(),
            directories: options.directories,
            handle,
        };

        if let Some(token) = options.resume {
            pipeline.restore(token, &options.store, &options.participant_id, options.mode)?;
        }

        Ok(pipeline)
    }

    fn restore(
        &mut self,
        token: SuspendedRun,
        store: &RunStore,
        participant_id: &str,
        mode: ExecutionMode,
    ) -> PipelineResult<()> {
        let Some(controller) = self.controllers.get_mut(token.current_step) else {
            return Err(PipelineError::InvalidSpec(format!(
                "Cannot resume at step {} of a {}-step pipeline",
                token.current_step,
                self.steps.len()
            )));
        };

        controller.restore(token.controller_state);
        self.handle
            .current_step
            .store(token.current_step, Ordering::SeqCst);
        *self.handle.cache.lock() = token.pipeline_cache;

        let group_form = mode == ExecutionMode::Remote
            && self.steps[token.current_step].controller.controller_type
                == ControllerType::Decentralized;
        match token.output {
            Some(Value::Object(group)) if group_form => {
                for (id, value) in group {
                    store.put(&self.run_id, &id, StoreValue::Output(value));
                }
            }
            Some(output) => store.put(&self.run_id, participant_id, StoreValue::Output(output)),
            None => {}
        }

        info!(
            run_id = %self.run_id,
            step = token.current_step,
            "Resuming pipeline"
        );
        Ok(())
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Run every remaining step and return the last step's output.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a step.
    pub async fn run(mut self, remote: Arc<dyn RemoteHandler>) -> PipelineResult<Value> {
        let first = self.handle.current_step();
        let total = self.controllers.len();
        let mut output = Value::Null;

        for index in first..total {
            self.handle.current_step.store(index, Ordering::SeqCst);
            let input = self.step_input(index)?;

            info!(run_id = %self.run_id, step = index, total, "Starting step");
            output = self.controllers[index].start(input, remote.as_ref()).await?;
            self.keep_cached_variables(index, &output);

            if index + 1 < total {
                clear_directory(&self.directories.transfer).await?;
            }
        }

        Ok(output)
    }

    fn step_input(&self, index: usize) -> PipelineResult<Value> {
        let cache = self.handle.cache.lock();
        let mut input = Map::new();
        for (name, source) in &self.steps[index].input_map {
            let value = match source {
                InputSource::Value { value } => value.clone(),
                InputSource::FromCache { from_cache } => cache
                    .get(&from_cache.step)
                    .and_then(|outputs| outputs.get(&from_cache.variable))
                    .cloned()
                    .ok_or_else(|| {
                        PipelineError::InvalidSpec(format!(
                            "Step {index} input '{name}' needs '{}' from step {}, which produced none",
                            from_cache.variable, from_cache.step
                        ))
                    })?,
            };
            input.insert(name.clone(), value);
        }
        Ok(Value::Object(input))
    }

    fn keep_cached_variables(&self, index: usize, output: &Value) {
        let Some(variables) = self.cached_variables.get(&index) else {
            return;
        };
        let kept: Map<String, Value> = variables
            .iter()
            .filter_map(|name| output.get(name).map(|value| (name.clone(), value.clone())))
            .collect();
        self.handle.cache.lock().insert(index, Value::Object(kept));
    }
}

fn validate(spec: &PipelineSpec) -> PipelineResult<()> {
    if spec.steps.is_empty() {
        return Err(PipelineError::InvalidSpec(
            "Pipeline has no steps".to_string(),
        ));
    }
    for (index, step) in spec.steps.iter().enumerate() {
        for (name, source) in &step.input_map {
            if let InputSource::FromCache { from_cache } = source {
                if from_cache.step >= index {
                    return Err(PipelineError::InvalidSpec(format!(
                        "Step {index} input '{name}' references step {}, which does not run before it",
                        from_cache.step
                    )));
                }
            }
        }
    }
    Ok(())
}
