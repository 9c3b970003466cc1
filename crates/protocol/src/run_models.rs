//! Run bookkeeping models.
//!
//! These structures describe a run as the pipeline manager sees it: its
//! lifecycle state, the error shape every failure is reported in, the
//! progress snapshot pushed to listeners and the token produced when a run is
//! suspended.

use crate::controller_models::{ControllerState, ExecutionMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use ts_rs::TS;

/// Lifecycle of an active run.
///
/// `Created -> Running -> Finished | Error`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    /// Directories exist, peers have not been invited yet.
    Created,

    /// The run is exchanging data with its participants.
    Running,

    /// The final result has been produced.
    Finished,

    /// The run failed. The error is sticky.
    Error,
}

/// Error shape handed to callers and sent over the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Short machine-readable code such as `stop-by-user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Input of the computation that failed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl RunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            error: None,
            input: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error = Some(code.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Prefix both the message and the code with `context`.
    pub fn annotate(mut self, context: &str) -> Self {
        self.message = format!("{context}\n Error details: {}", self.message);
        if let Some(code) = self.error.take() {
            self.error = Some(format!("{context}\n Error details: {code}"));
        }
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Manager-side view of a run that is merged into every progress snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunSnapshot {
    pub state: RunState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_status: Option<String>,

    /// Participants the central node is still waiting on.
    #[serde(default)]
    pub waiting_on: Vec<String>,
}

/// Progress of a run, pushed to state listeners.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct RunStateSnapshot {
    pub mode: ExecutionMode,
    pub pipeline_step: usize,
    pub total_steps: usize,
    pub current_iteration: u64,
    pub controller_state: ControllerState,
    pub run: ActiveRunSnapshot,
}

/// Serializable token returned by a suspend request.
///
/// Feeding it back into a new start resumes the run at the same step,
/// iteration and controller phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedRun {
    /// Pending output at the moment the controller halted. On the central
    /// node of a decentralized step this is an object keyed by participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    pub controller_state: ControllerState,

    pub current_step: usize,

    /// Outputs of completed steps, keyed by step index.
    #[serde(default)]
    pub pipeline_cache: BTreeMap<usize, Value>,

    pub active_run_state: ActiveRunSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_error_annotate() {
        let error = RunError::new("boom")
            .with_code("computation")
            .annotate("Pipeline error from pipeline run-1 user: site-a");

        assert_eq!(
            error.message,
            "Pipeline error from pipeline run-1 user: site-a\n Error details: boom"
        );
        assert!(error.error.unwrap().ends_with("computation"));
    }

    #[test]
    fn test_run_error_omits_empty_fields() {
        let json = serde_json::to_value(RunError::new("boom")).unwrap();
        assert_eq!(json, json!({ "message": "boom" }));
    }

    #[test]
    fn test_suspended_run_survives_json() {
        let mut cache = BTreeMap::new();
        cache.insert(0, json!({ "sum": 2 }));
        let token = SuspendedRun {
            output: Some(json!({ "sum": 4 })),
            controller_state: ControllerState {
                iteration: 3,
                ..ControllerState::default()
            },
            current_step: 1,
            pipeline_cache: cache,
            active_run_state: ActiveRunSnapshot {
                state: RunState::Running,
                state_status: None,
                waiting_on: vec![],
            },
        };

        let text = serde_json::to_string(&token).unwrap();
        let parsed: SuspendedRun = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, token);
    }
}
