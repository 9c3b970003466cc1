//! Controller state models.
//!
//! This module defines the state a step controller carries between ticks,
//! the labels of its phases and the commands its control box can issue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use ts_rs::TS;

/// Where a node sits in the run.
///
/// Peers execute in `Local` mode, the central coordinator in `Remote` mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
}

/// Human-readable phase label of a controller.
///
/// The label doubles as the tag of the controller's state machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
pub enum ControllerPhase {
    #[serde(rename = "initializing")]
    Initializing,

    #[serde(rename = "started")]
    Started,

    #[serde(rename = "running computation")]
    RunningComputation,

    #[serde(rename = "finished iteration")]
    FinishedIteration,

    #[serde(rename = "iteration finished with an error")]
    IterationFinishedWithError,

    #[serde(rename = "waiting on local nodes")]
    WaitingOnLocalNodes,

    #[serde(rename = "waiting on central node")]
    WaitingOnCentralNode,

    #[serde(rename = "received data from network")]
    ReceivedData,

    #[serde(rename = "stopped")]
    Stopped,
}

impl ControllerPhase {
    /// Whether the last iteration has produced a result (successful or not).
    pub fn is_finished_iteration(self) -> bool {
        matches!(
            self,
            ControllerPhase::FinishedIteration | ControllerPhase::IterationFinishedWithError
        )
    }

    /// Phases at which a pending stop request is honored.
    pub fn is_stop_checkpoint(self) -> bool {
        matches!(
            self,
            ControllerPhase::FinishedIteration | ControllerPhase::ReceivedData
        )
    }
}

/// Action chosen by a control box for one tick.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub enum BoxCommand {
    /// Run the computation unit again.
    NextIteration,

    /// Reserved. No control box issues it.
    NextComputation,

    /// Exchange the current result with the other side and wait.
    Remote,

    /// Central node only: open the run to peers and wait for their first results.
    FirstServerRemote,

    /// Central node only: send the final result and finish.
    DoneRemote,

    /// Finish the step with the value held in the run store.
    Done,
}

/// Reason a controller was asked to halt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub enum StopKind {
    User,
    Suspend,
}

/// Mutable state of a single step controller.
///
/// Only the controller writes it. Control boxes and observers read
/// snapshots.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    /// Completed computation invocations or network round-trips.
    pub iteration: u64,

    /// Phase label.
    pub state: ControllerPhase,

    /// Whether the computation has reported convergence.
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_box_command: Option<BoxCommand>,

    /// Cache the computation unit carries between its own invocations.
    #[serde(default)]
    pub computation_cache: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<StopKind>,

    /// State this controller was resumed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_previous_state: Option<Box<ControllerState>>,

    /// Central node only: true until the first tick has been decided.
    #[serde(default)]
    pub remote_initial: bool,

    /// Millisecond timestamp of the last network delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<i64>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            iteration: 0,
            state: ControllerPhase::Initializing,
            success: false,
            current_box_command: None,
            computation_cache: BTreeMap::new(),
            stop_signal: None,
            saved_previous_state: None,
            remote_initial: false,
            received: None,
        }
    }
}
