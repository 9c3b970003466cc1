//! Computation adapter implementations.

mod docker;
pub mod mock;
mod process;

pub use docker::DockerComputation;
pub use mock::MockComputation;
pub use process::ProcessComputation;
