//! Run state.
//!
//! - [`store`]: at-most-once result handoff keyed by run and participant
//! - [`run`]: per-run bookkeeping and its directory layout
//! - [`manager`]: the node-level registry that starts, stops and tracks runs

pub mod manager;
pub mod run;
pub mod store;
