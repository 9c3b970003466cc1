//! Pipeline specification models.
//!
//! A pipeline specification is the ordered list of steps every participant of
//! a run executes. The same document is handed to the central node and to
//! every peer, which is what keeps all of them on the same sequence of steps.
//!
//! The wire format is camelCase JSON (or the equivalent YAML):
//!
//! ```json
//! {
//!   "steps": [{
//!     "controller": { "type": "decentralized" },
//!     "computations": [{ "meta": { "id": "sum" }, "computation": { "type": "process", "command": ["sum"] } }],
//!     "inputMap": {
//!       "start": { "value": 1 },
//!       "covariates": { "fromCache": { "step": 0, "variable": "sum" } }
//!     }
//!   }],
//!   "owner": "site-a",
//!   "limitOutputToOwner": false
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use ts_rs::TS;

/// Complete definition of a multi-step pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Ordered list of steps. Every participant walks them in this order.
    pub steps: Vec<StepSpec>,

    /// Participant that owns the run (typically the consortium owner).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// When set, only the owner receives the real final output.
    #[serde(default)]
    pub limit_output_to_owner: bool,
}

impl PipelineSpec {
    /// Map of step index to the output variables later steps read from it.
    ///
    /// Only the variables listed here need to survive once a step resolves.
    pub fn cached_variables(&self) -> BTreeMap<usize, BTreeSet<String>> {
        let mut cache: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for step in &self.steps {
            for source in step.input_map.values() {
                if let InputSource::FromCache { from_cache } = source {
                    cache
                        .entry(from_cache.step)
                        .or_default()
                        .insert(from_cache.variable.clone());
                }
            }
        }
        cache
    }

    /// Whether any step needs the message bus.
    pub fn is_decentralized(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.controller.controller_type == ControllerType::Decentralized)
    }
}

/// A single step of a pipeline, driven by one controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Which control policy drives this step.
    pub controller: ControllerSpec,

    /// Computation units executed by this step. The first one is invoked on
    /// every iteration.
    pub computations: Vec<ComputationSpec>,

    /// Named inputs handed to the first iteration.
    #[serde(default)]
    pub input_map: BTreeMap<String, InputSource>,
}

/// Controller descriptor of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ControllerSpec {
    #[serde(rename = "type")]
    pub controller_type: ControllerType,
}

/// Control policy of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// Iterate locally until the computation reports success.
    Local,

    /// Alternate local computation with a round-trip through the central node.
    Decentralized,
}

/// Where a named step input comes from.
///
/// Untagged: `{ "value": ... }` or `{ "fromCache": { "step": 0, "variable": "x" } }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(untagged)]
pub enum InputSource {
    /// Read an output variable of an earlier step.
    FromCache {
        #[serde(rename = "fromCache")]
        from_cache: CacheReference,
    },

    /// A literal value.
    Value { value: Value },
}

/// Reference to an output variable of an earlier step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct CacheReference {
    pub step: usize,
    pub variable: String,
}

/// A computation unit declaration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ComputationSpec {
    pub meta: ComputationMeta,
    pub computation: ComputationDefinition,
}

/// Descriptive metadata of a computation unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ComputationMeta {
    /// Identifier used to resolve the unit, e.g. against a registry override.
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a computation unit is launched, plus its declared input and output schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct ComputationDefinition {
    /// Launcher kind: `docker` or `process`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub input: BTreeMap<String, Value>,

    #[serde(default)]
    pub output: BTreeMap<String, Value>,

    /// Launcher used on the central node for decentralized steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteDefinition>,
}

/// Central-node launcher of a decentralized computation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    #[serde(default)]
    pub command: Vec<String>,
}
