//! Step controller.
//!
//! A controller drives one computation unit through as many iterations as
//! its control box asks for. The loop runs over an explicit work queue so
//! that a step with thousands of iterations never grows the stack.
//!
//! Network round-trips are delegated to a [`RemoteHandler`] owned by the
//! pipeline manager; the controller only records what comes back.

use crate::computation::base::{Computation, ComputationRequest, ExecutionContext};
use crate::engine::control_box::ControlBox;
use crate::error::{PipelineError, PipelineResult};
use crate::state::store::{RunStore, StoreValue};
use async_trait::async_trait;
use dcp_protocol::controller_models::{
    BoxCommand, ControllerPhase, ControllerState, ExecutionMode, StopKind,
};
use dcp_protocol::pipeline_models::ControllerType;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Which network action the controller is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Remote,
    FirstServerRemote,
    DoneRemote,
}

impl RemoteKind {
    fn from_command(command: BoxCommand) -> Option<Self> {
        match command {
            BoxCommand::Remote => Some(RemoteKind::Remote),
            BoxCommand::FirstServerRemote => Some(RemoteKind::FirstServerRemote),
            BoxCommand::DoneRemote => Some(RemoteKind::DoneRemote),
            _ => None,
        }
    }
}

/// A network round-trip requested by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub run_id: String,
    pub kind: RemoteKind,
    /// Convergence flag of the last iteration.
    pub success: bool,
    /// Iterations completed so far.
    pub iteration: u64,
}

/// What the network delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteReply {
    pub success: bool,
    /// Millisecond timestamp of the delivery.
    pub received: Option<i64>,
}

/// Bridge between a controller and the coordination layer.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Send this node's pending result and wait for the other side.
    async fn handle(&self, request: RemoteRequest) -> PipelineResult<RemoteReply>;
}

/// Progress notification sent after every phase change.
#[derive(Debug, Clone)]
pub struct ControllerUpdate {
    pub step: usize,
    pub state: ControllerState,
}

/// What a controller hands back when it honors a stop request.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    /// Result pending in the run store at the moment of the stop.
    pub output: Option<Value>,
    pub controller_state: ControllerState,
}

/// Shared view of a running controller.
#[derive(Clone, Default)]
pub struct ControllerHandle {
    state: Arc<Mutex<ControllerState>>,
    stop_waiter: Arc<Mutex<Option<oneshot::Sender<StopOutcome>>>>,
}

impl ControllerHandle {
    pub fn snapshot(&self) -> ControllerState {
        self.state.lock().clone()
    }

    pub fn iteration(&self) -> u64 {
        self.state.lock().iteration
    }

    /// Ask the controller to halt at its next safe point.
    ///
    /// The returned receiver yields the controller's state once it halts.
    /// It errors if the controller ends for another reason first.
    pub fn request_stop(&self, kind: StopKind) -> oneshot::Receiver<StopOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.stop_waiter.lock() = Some(tx);
        self.state.lock().stop_signal = Some(kind);
        rx
    }

    fn release_stop_waiter(&self) -> Option<oneshot::Sender<StopOutcome>> {
        self.stop_waiter.lock().take()
    }
}

enum Work {
    Tick,
    Deliver(Value),
}

enum Transition {
    Continue,
    Deliver(Value),
}

/// Everything a controller needs to run one step.
pub struct ControllerOptions {
    pub step: usize,
    pub controller_type: ControllerType,
    pub computation: Arc<dyn Computation>,
    pub context: ExecutionContext,
    pub store: RunStore,
    pub updates: Option<mpsc::UnboundedSender<ControllerUpdate>>,
}

/// Drives a single step.
pub struct Controller {
    step: usize,
    controller_type: ControllerType,
    control_box: ControlBox,
    computation: Arc<dyn Computation>,
    context: ExecutionContext,
    store: RunStore,
    updates: Option<mpsc::UnboundedSender<ControllerUpdate>>,
    handle: ControllerHandle,
    last_output: Option<Value>,
    resumed: bool,
}

impl Controller {
    pub fn new(options: ControllerOptions) -> Self {
        Self {
            step: options.step,
            controller_type: options.controller_type,
            control_box: ControlBox::for_controller(options.controller_type),
            computation: options.computation,
            context: options.context,
            store: options.store,
            updates: options.updates,
            handle: ControllerHandle::default(),
            last_output: None,
            resumed: false,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    fn run_id(&self) -> &str {
        &self.context.run_id
    }

    fn participant_id(&self) -> &str {
        &self.context.participant_id
    }

    /// Central nodes gather every peer's result at once.
    fn fetches_group(&self) -> bool {
        self.context.mode == ExecutionMode::Remote
            && self.controller_type == ControllerType::Decentralized
    }

    /// Continue from a suspended state instead of starting fresh.
    pub fn restore(&mut self, saved: ControllerState) {
        let mut previous = saved.clone();
        previous.saved_previous_state = None;

        let mut restored = saved;
        restored.saved_previous_state = Some(Box::new(previous));
        restored.stop_signal = None;
        restored.remote_initial = false;
        restored.current_box_command = None;

        *self.handle.state.lock() = restored;
        self.resumed = true;
    }

    /// Run the step to completion.
    ///
    /// # Arguments
    ///
    /// * `input` - Input of the first iteration
    /// * `remote` - Handler for network round-trips
    ///
    /// # Returns
    ///
    /// The value the step resolved with.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, including `UserStop`/`Suspend` when a
    /// stop request was honored. The computation unit is stopped before the
    /// error propagates.
    pub async fn start(&mut self, input: Value, remote: &dyn RemoteHandler) -> PipelineResult<Value> {
        self.initialize();

        let mut queue = VecDeque::from([Work::Tick]);
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Tick => match self.tick(&input, remote).await {
                    Ok(Transition::Continue) => queue.push_back(Work::Tick),
                    Ok(Transition::Deliver(value)) => queue.push_back(Work::Deliver(value)),
                    Err(error) => {
                        self.teardown().await;
                        return Err(error);
                    }
                },
                Work::Deliver(value) => {
                    drop(self.handle.release_stop_waiter());
                    self.set_phase(ControllerPhase::Stopped);
                    return Ok(value);
                }
            }
        }

        Err(PipelineError::Protocol(
            "Controller finished without a result".to_string(),
        ))
    }

    fn initialize(&mut self) {
        if self.resumed {
            let phase = self.handle.state.lock().state;
            self.set_phase(phase);
            return;
        }

        {
            let mut state = self.handle.state.lock();
            // A stop requested before the step started still applies.
            let stop_signal = state.stop_signal;
            *state = ControllerState {
                remote_initial: self.fetches_group(),
                stop_signal,
                ..ControllerState::default()
            };
        }
        self.set_phase(ControllerPhase::Started);
    }

    fn decide(&self) -> BoxCommand {
        let mut state = self.handle.state.lock();
        let command = self.control_box.pre_iteration(&state, self.context.mode);
        state.current_box_command = Some(command);
        state.remote_initial = false;
        command
    }

    async fn tick(&mut self, input: &Value, remote: &dyn RemoteHandler) -> PipelineResult<Transition> {
        let command = self.decide();
        debug!(
            run_id = %self.run_id(),
            step = self.step,
            ?command,
            "Controller tick"
        );

        match command {
            BoxCommand::NextIteration => self.next_iteration(input).await,
            BoxCommand::Remote | BoxCommand::FirstServerRemote | BoxCommand::DoneRemote => {
                self.remote_round(command, remote).await
            }
            BoxCommand::Done => self.drain().map(Transition::Deliver),
            BoxCommand::NextComputation => Err(PipelineError::Protocol(
                "nextComputation is not supported".to_string(),
            )),
        }
    }

    async fn next_iteration(&mut self, input: &Value) -> PipelineResult<Transition> {
        let iteration = self.handle.iteration();
        self.set_phase(ControllerPhase::RunningComputation);

        let fetched = if self.fetches_group() {
            let group = self.store.get_and_remove_group(self.run_id());
            (!group.is_empty()).then(|| {
                Value::Object(
                    group
                        .into_iter()
                        .map(|(id, value)| (id, value.to_json()))
                        .collect(),
                )
            })
        } else {
            match self.store.get_and_remove(self.run_id(), self.participant_id()) {
                Some(StoreValue::Output(value)) => Some(value),
                Some(StoreValue::Error(error)) => return Err(PipelineError::Remote(error)),
                None => None,
            }
        };

        let computation_input = match fetched {
            Some(value) => value,
            None if iteration == 0 => input.clone(),
            None => {
                return Err(PipelineError::Protocol(format!(
                    "No input available for iteration {iteration}"
                )))
            }
        };

        let context = self.context.clone().with_iteration(iteration);
        let cache = self.handle.state.lock().computation_cache.clone();
        let request = ComputationRequest::new(computation_input.clone(), cache, &context);

        match self.computation.start(request, &context).await {
            Ok(result) => {
                {
                    let mut state = self.handle.state.lock();
                    state.computation_cache.extend(result.cache);
                    state.success = result.success;
                    state.iteration += 1;
                }
                self.last_output = Some(result.output.clone());
                self.store.put(
                    self.run_id(),
                    self.participant_id(),
                    StoreValue::Output(result.output),
                );
                self.set_phase(ControllerPhase::FinishedIteration);
                self.checkpoint()?;
                Ok(Transition::Continue)
            }
            Err(source) => {
                let error = PipelineError::Computation {
                    source,
                    input: Some(computation_input),
                };
                if self.controller_type == ControllerType::Local {
                    return Err(error);
                }

                warn!(run_id = %self.run_id(), step = self.step, "Iteration failed: {error}");
                self.store.put(
                    self.run_id(),
                    self.participant_id(),
                    StoreValue::Error(error.to_run_error()),
                );
                self.handle.state.lock().iteration += 1;
                self.set_phase(ControllerPhase::IterationFinishedWithError);
                Ok(Transition::Continue)
            }
        }
    }

    async fn remote_round(
        &mut self,
        command: BoxCommand,
        remote: &dyn RemoteHandler,
    ) -> PipelineResult<Transition> {
        let Some(kind) = RemoteKind::from_command(command) else {
            return Err(PipelineError::Protocol(format!(
                "{command:?} is not a network command"
            )));
        };

        let waiting = match self.context.mode {
            ExecutionMode::Remote => ControllerPhase::WaitingOnLocalNodes,
            ExecutionMode::Local => ControllerPhase::WaitingOnCentralNode,
        };
        self.set_phase(waiting);

        let (success, iteration) = {
            let state = self.handle.state.lock();
            (state.success, state.iteration)
        };
        let reply = remote
            .handle(RemoteRequest {
                run_id: self.run_id().to_string(),
                kind,
                success,
                iteration,
            })
            .await?;

        if kind == RemoteKind::DoneRemote {
            return self.drain().map(Transition::Deliver);
        }

        {
            let mut state = self.handle.state.lock();
            state.success = reply.success;
            state.received = reply.received;
        }
        self.set_phase(ControllerPhase::ReceivedData);
        self.checkpoint()?;
        Ok(Transition::Continue)
    }

    /// Resolve the step with whatever is pending for this participant.
    fn drain(&mut self) -> PipelineResult<Value> {
        match self.store.get_and_remove(self.run_id(), self.participant_id()) {
            Some(StoreValue::Output(value)) => Ok(value),
            Some(StoreValue::Error(error)) => Err(PipelineError::Remote(error)),
            None => Ok(self.last_output.take().unwrap_or(Value::Null)),
        }
    }

    /// Honor a pending stop request.
    fn checkpoint(&self) -> PipelineResult<()> {
        let (signal, controller_state) = {
            let state = self.handle.state.lock();
            if !state.state.is_stop_checkpoint() {
                return Ok(());
            }
            match state.stop_signal {
                Some(signal) => (signal, state.clone()),
                None => return Ok(()),
            }
        };

        let outcome = StopOutcome {
            output: self.pending_output(),
            controller_state,
        };
        if let Some(waiter) = self.handle.release_stop_waiter() {
            let _ = waiter.send(outcome);
        }

        Err(match signal {
            StopKind::User => PipelineError::UserStop,
            StopKind::Suspend => PipelineError::Suspend,
        })
    }

    fn pending_output(&self) -> Option<Value> {
        if self.fetches_group() {
            let group = self.store.get_group(self.run_id());
            return (!group.is_empty()).then(|| {
                Value::Object(
                    group
                        .into_iter()
                        .map(|(id, value)| (id, value.to_json()))
                        .collect(),
                )
            });
        }
        match self.store.get(self.run_id(), self.participant_id()) {
            Some(StoreValue::Output(value)) => Some(value),
            _ => None,
        }
    }

    async fn teardown(&self) {
        drop(self.handle.release_stop_waiter());
        self.computation.stop().await;
    }

    fn set_phase(&self, phase: ControllerPhase) {
        let snapshot = {
            let mut state = self.handle.state.lock();
            state.state = phase;
            state.clone()
        };
        if let Some(updates) = &self.updates {
            let _ = updates.send(ControllerUpdate {
                step: self.step,
                state: snapshot,
            });
        }
    }
}
