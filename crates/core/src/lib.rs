//! # dcp-core
//!
//! Engine of a decentralized computation pipeline.
//!
//! A central node and any number of peers walk the same ordered list of
//! steps. Each step is driven by a controller that iterates a computation
//! unit and, on decentralized steps, exchanges results with the other
//! nodes until the central computation reports convergence.
//!
//! ## Modules
//!
//! - [`computation`]: computation units and how they are resolved
//! - [`config`]: node configuration and pipeline spec loading
//! - [`engine`]: controllers, control boxes and step chaining
//! - [`error`]: the engine's error taxonomy
//! - [`network`]: message bus, file transfer and the coordination protocol
//! - [`state`]: run store, run bookkeeping and the pipeline manager

pub mod computation;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod state;

pub use error::{PipelineError, PipelineResult};
pub use state::manager::{PipelineManager, StartPipelineOptions, StartedPipeline};
