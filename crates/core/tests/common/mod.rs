//! Shared helpers for the integration tests.
//!
//! - Fixtures: pipeline specs, node configs and a hermetic multi-node network
//! - Mock computations with deterministic, scriptable behavior
//! - Assertions over progress events

pub mod assertions;
pub mod computations;
pub mod fixtures;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use computations::*;
#[allow(unused_imports)]
pub use fixtures::*;
