//! # dcp-protocol
//!
//! Shared data models for the decentralized pipeline engine.
//!
//! This crate defines all shared data structures used for:
//! - Pipeline specifications handed to every participant
//! - Controller state and the suspend/resume token
//! - Message-bus wire messages exchanged between nodes
//! - Progress events pushed to run listeners
//! - Node configuration
//!
//! ## Modules
//!
//! - [`pipeline_models`]: Pipeline, step and computation specifications
//! - [`controller_models`]: Controller state, phases and control-box commands
//! - [`run_models`]: Run lifecycle, error shape, snapshots, suspend token
//! - [`messages`]: Per-topic wire messages and inbound decoding
//! - [`ipc`]: Events for run listeners
//! - [`config_models`]: Node configuration
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, serde_json and ts-rs
//! - TypeScript generation: Types derive `TS` for the desktop client
//! - Independent compilation: No dependencies on other dcp crates

pub mod config_models;
pub mod controller_models;
pub mod ipc;
pub mod messages;
pub mod pipeline_models;
pub mod run_models;

// Re-export all public types for convenience
pub use config_models::*;
pub use controller_models::*;
pub use ipc::*;
pub use messages::*;
pub use pipeline_models::*;
pub use run_models::*;
