//! Computation units.
//!
//! This module wraps the external collaborator that actually runs a step:
//! a docker container or a local process speaking JSON over stdin/stdout.

pub mod adapters;
pub mod base;
pub mod executor;
pub mod factory;
pub mod registry;

pub use base::{
    Computation, ComputationError, ComputationOutput, ComputationRequest, ExecutionContext,
};
pub use factory::ComputationFactory;
pub use registry::ComputationRegistry;
