//! Iteration policies.
//!
//! A control box looks at a controller's state and names the next action.
//! It never mutates anything.

use dcp_protocol::controller_models::{BoxCommand, ControllerState, ExecutionMode};
use dcp_protocol::pipeline_models::ControllerType;

/// Policy selected by a step's `controller.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlBox {
    /// Iterate until the computation converges.
    Local,
    /// Alternate local iterations with network round-trips.
    Decentralized,
}

impl ControlBox {
    pub fn for_controller(controller_type: ControllerType) -> Self {
        match controller_type {
            ControllerType::Local => ControlBox::Local,
            ControllerType::Decentralized => ControlBox::Decentralized,
        }
    }

    /// Decide the command for the next tick.
    ///
    /// # Arguments
    ///
    /// * `state` - Snapshot of the controller's state
    /// * `mode` - Whether this node is the central coordinator (`Remote`) or a peer
    pub fn pre_iteration(self, state: &ControllerState, mode: ExecutionMode) -> BoxCommand {
        match self {
            ControlBox::Local => {
                if state.success {
                    BoxCommand::Done
                } else {
                    BoxCommand::NextIteration
                }
            }
            ControlBox::Decentralized => {
                if state.success && mode == ExecutionMode::Remote {
                    BoxCommand::DoneRemote
                } else if state.success {
                    BoxCommand::Done
                } else if state.remote_initial {
                    BoxCommand::FirstServerRemote
                } else if state.state.is_finished_iteration() {
                    BoxCommand::Remote
                } else {
                    BoxCommand::NextIteration
                }
            }
        }
    }
}
