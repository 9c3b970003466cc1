//! Configuration loading.
//!
//! Node settings come from a TOML file, pipeline specs from JSON or YAML
//! files.

pub mod error;
pub mod loader;
