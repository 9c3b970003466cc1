//! Events pushed from the engine to run listeners.
//!
//! Every active run owns a broadcast channel of [`Event`]s. The desktop UI (or
//! the CLI) subscribes through the pipeline manager's state listener and
//! renders progress from these events.
//!
//! Uses tagged enum serialization for TypeScript compatibility:
//! ```json
//! {
//!   "type": "stateUpdate",
//!   "payload": {
//!     "runId": "run-1",
//!     "snapshot": { "pipelineStep": 0, "totalSteps": 2, "...": "..." }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::run_models::{RunError, RunStateSnapshot};

/// Progress events of a single run.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// Working directories are in place and the first step is starting.
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: String, total_steps: usize },

    /// A controller changed phase or the set of awaited participants changed.
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        run_id: String,
        snapshot: Box<RunStateSnapshot>,
    },

    /// The last step resolved.
    #[serde(rename_all = "camelCase")]
    RunCompleted { run_id: String, output: Value },

    /// The run failed, was stopped or was suspended.
    #[serde(rename_all = "camelCase")]
    RunFailed { run_id: String, error: RunError },
}

impl Event {
    pub fn run_id(&self) -> &str {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::StateUpdate { run_id, .. }
            | Event::RunCompleted { run_id, .. }
            | Event::RunFailed { run_id, .. } => run_id,
        }
    }
}
