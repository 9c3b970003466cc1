//! Computation registry for resolving the unit behind each step.
//!
//! The `ComputationRegistry` is responsible for:
//! - Holding in-process overrides keyed by computation id
//! - Falling back to the factory for declared docker/process units
//! - Refusing units that report themselves unavailable

use crate::computation::base::{Computation, ComputationError};
use crate::computation::factory::ComputationFactory;
use dcp_protocol::controller_models::ExecutionMode;
use dcp_protocol::pipeline_models::ComputationSpec;
use std::collections::HashMap;
use std::sync::Arc;

type Builder = dyn Fn(ExecutionMode) -> Arc<dyn Computation> + Send + Sync;

/// Resolves computation declarations into runnable units.
///
/// Overrides are builders rather than instances because a unit's `stop`
/// must only affect the run that owns it.
#[derive(Clone, Default)]
pub struct ComputationRegistry {
    overrides: HashMap<String, Arc<Builder>>,
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve computation `id` from `builder` instead of its declaration.
    ///
    /// # Arguments
    ///
    /// * `id` - The `meta.id` of the computation to override
    /// * `builder` - Called once per step with the node's execution mode
    pub fn register<F>(&mut self, id: impl Into<String>, builder: F)
    where
        F: Fn(ExecutionMode) -> Arc<dyn Computation> + Send + Sync + 'static,
    {
        self.overrides.insert(id.into(), Arc::new(builder));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, id: impl Into<String>, builder: F) -> Self
    where
        F: Fn(ExecutionMode) -> Arc<dyn Computation> + Send + Sync + 'static,
    {
        self.register(id, builder);
        self
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.overrides.contains_key(id)
    }

    /// Resolve the unit for `spec` without checking availability.
    ///
    /// # Errors
    ///
    /// Returns `ComputationError::NotAvailable` if the declaration cannot be
    /// turned into a unit.
    pub fn resolve(
        &self,
        spec: &ComputationSpec,
        mode: ExecutionMode,
    ) -> Result<Arc<dyn Computation>, ComputationError> {
        if let Some(builder) = self.overrides.get(&spec.meta.id) {
            return Ok(builder(mode));
        }
        ComputationFactory::create(spec, mode)
            .map_err(|e| ComputationError::NotAvailable(e.to_string()))
    }

    /// Resolve the unit for `spec` and make sure it can run here.
    ///
    /// # Errors
    ///
    /// Returns `ComputationError::NotAvailable` if resolution fails or the
    /// unit reports itself unavailable.
    pub async fn resolve_available(
        &self,
        spec: &ComputationSpec,
        mode: ExecutionMode,
    ) -> Result<Arc<dyn Computation>, ComputationError> {
        let computation = self.resolve(spec, mode)?;
        if computation.check_availability().await {
            Ok(computation)
        } else {
            Err(ComputationError::NotAvailable(format!(
                "Computation {} is not available on this node",
                spec.meta.id
            )))
        }
    }
}
