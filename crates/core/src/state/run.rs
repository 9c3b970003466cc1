//! Active run bookkeeping.
//!
//! This module provides the per-run record kept by the pipeline manager and
//! the functions that move a run through its lifecycle while emitting
//! events to its listeners.

use crate::engine::controller::RemoteReply;
use crate::engine::PipelineHandle;
use crate::error::{PipelineError, PipelineResult};
use crate::state::store::StoreValue;
use dcp_protocol::controller_models::ExecutionMode;
use dcp_protocol::ipc::Event;
use dcp_protocol::messages::{DebugTimes, PeerRunMessage};
use dcp_protocol::run_models::{
    ActiveRunSnapshot, RunError, RunState, RunStateSnapshot,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, oneshot};

/// Per-run working directories of one participant.
///
/// Layout: `{root}/{input,output,transfer,system}/{participant}/{run}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    /// Input data, and on the central node the files received from peers.
    pub base: PathBuf,
    /// Final results.
    pub output: PathBuf,
    /// Staging area computations write files to send into.
    pub transfer: PathBuf,
    /// Archive parts in flight.
    pub system: PathBuf,
}

impl RunDirectories {
    pub fn for_participant(root: &Path, participant_id: &str, run_id: &str) -> Self {
        let dir = |kind: &str| root.join(kind).join(participant_id).join(run_id);
        Self {
            base: dir("input"),
            output: dir("output"),
            transfer: dir("transfer"),
            system: dir("system"),
        }
    }

    /// Create all four directories.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Directory` naming the first directory that
    /// could not be created.
    pub async fn create_all(&self) -> PipelineResult<()> {
        for path in [&self.base, &self.output, &self.transfer, &self.system] {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|source| PipelineError::Directory {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Remove the transfer and system directories. Missing paths are fine,
    /// so repeated calls are harmless.
    pub async fn remove_scratch(&self) -> PipelineResult<()> {
        for path in [&self.transfer, &self.system] {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::io(path, e)),
            }
        }
        Ok(())
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub async fn clear_directory(dir: &Path) -> PipelineResult<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(dir, e))?
    {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| PipelineError::io(&path, e))?
            .is_dir();
        let removed = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(&path, e)),
        }
    }
    Ok(())
}

/// Result of a network round-trip.
pub type RemoteResult = PipelineResult<RemoteReply>;

/// Binding between a waiting controller and the network handlers.
///
/// A result that arrives while nothing waits is parked and handed to the
/// next waiter.
#[derive(Default)]
pub enum RemoteSlot {
    #[default]
    Idle,
    Armed(oneshot::Sender<RemoteResult>),
    Ready(RemoteResult),
}

impl RemoteSlot {
    /// Start waiting. Resolves immediately if a result is parked.
    pub fn arm(&mut self) -> oneshot::Receiver<RemoteResult> {
        let (tx, rx) = oneshot::channel();
        match std::mem::take(self) {
            RemoteSlot::Ready(result) => {
                let _ = tx.send(result);
            }
            RemoteSlot::Idle | RemoteSlot::Armed(_) => *self = RemoteSlot::Armed(tx),
        }
        rx
    }

    pub fn resolve(&mut self, result: RemoteResult) {
        match std::mem::take(self) {
            RemoteSlot::Armed(tx) => {
                if let Err(result) = tx.send(result) {
                    *self = RemoteSlot::Ready(result);
                }
            }
            // A parked error wins over anything that arrives after it.
            RemoteSlot::Ready(Err(existing)) => *self = RemoteSlot::Ready(Err(existing)),
            RemoteSlot::Ready(Ok(_)) | RemoteSlot::Idle => *self = RemoteSlot::Ready(result),
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, RemoteSlot::Armed(_))
    }
}

/// Registration state of a remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    PreRegistered,
    Registered,
}

/// Files a client announced for the current iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFiles {
    pub expected: Vec<String>,
    pub received: Vec<String>,
    /// The announced archive has been reassembled and extracted.
    pub unpacked: bool,
    /// Extraction is in flight.
    pub unpacking: bool,
}

impl ClientFiles {
    /// Every announced part has arrived.
    pub fn all_received(&self) -> bool {
        self.expected
            .iter()
            .all(|expected| self.received.contains(expected))
    }

    /// Files are still outstanding for this iteration.
    pub fn pending(&self) -> bool {
        !self.expected.is_empty() && !self.unpacked
    }

    pub fn clear(&mut self) {
        *self = ClientFiles::default();
    }
}

/// Per-run state of one remote client.
#[derive(Debug, Clone, Default)]
pub struct ClientRun {
    pub files: ClientFiles,
    pub debug: DebugTimes,
    /// Accumulated transmission time per task, in milliseconds.
    pub profiling: BTreeMap<String, i64>,
}

/// Central-node view of a peer.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    pub id: String,
    pub username: String,
    pub state: RegistrationState,
    pub runs: HashMap<String, ClientRun>,
}

impl RemoteClient {
    pub fn new(id: &str, username: &str, state: RegistrationState) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            state,
            runs: HashMap::new(),
        }
    }
}

/// Output a peer produced before its registration was acknowledged.
#[derive(Debug, Clone)]
pub struct StashedOutput {
    pub payload: StoreValue,
    pub iteration: u64,
    /// Entries already moved from the transfer to the system directory.
    pub staged: Vec<String>,
}

/// Options that shape a new [`ActiveRun`].
pub struct ActiveRunOptions {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub directories: RunDirectories,
    pub clients: BTreeMap<String, String>,
    pub owner: Option<String>,
    pub limit_output_to_owner: bool,
    pub pipeline: PipelineHandle,
}

/// Manager record of one run.
pub struct ActiveRun {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub state: RunState,
    pub state_status: Option<String>,
    pub directories: RunDirectories,
    /// Participant id to display name.
    pub clients: BTreeMap<String, String>,
    pub owner: Option<String>,
    pub limit_output_to_owner: bool,
    /// Peers that confirmed receipt of the final files.
    pub final_transfer_list: Option<BTreeSet<String>>,
    pub remote: RemoteSlot,
    pub error: Option<RunError>,
    pub registered: bool,
    pub stashed_output: Option<StashedOutput>,
    pub waiting_on: Vec<String>,
    /// Step and iteration whose barrier has already been released.
    pub released: Option<(usize, u64)>,
    /// Peer results for a step the central node has not started yet.
    pub early_messages: Vec<(PeerRunMessage, i64)>,
    pub pipeline: PipelineHandle,
    pub events: broadcast::Sender<Event>,
}

impl ActiveRun {
    /// Create a run in the `Created` state.
    pub fn new(options: ActiveRunOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            run_id: options.run_id,
            mode: options.mode,
            state: RunState::Created,
            state_status: None,
            directories: options.directories,
            clients: options.clients,
            owner: options.owner,
            limit_output_to_owner: options.limit_output_to_owner,
            final_transfer_list: None,
            remote: RemoteSlot::Idle,
            error: None,
            registered: false,
            stashed_output: None,
            waiting_on: Vec::new(),
            released: None,
            early_messages: Vec::new(),
            pipeline: options.pipeline,
            events,
        }
    }

    pub fn snapshot(&self) -> ActiveRunSnapshot {
        ActiveRunSnapshot {
            state: self.state,
            state_status: self.state_status.clone(),
            waiting_on: self.waiting_on.clone(),
        }
    }

    /// Merged pipeline and manager progress.
    pub fn state_snapshot(&self) -> RunStateSnapshot {
        let controller_state = self.pipeline.controller_state();
        RunStateSnapshot {
            mode: self.mode,
            pipeline_step: self.pipeline.current_step(),
            total_steps: self.pipeline.total_steps(),
            current_iteration: controller_state.iteration,
            controller_state,
            run: self.snapshot(),
        }
    }

    /// Whether every client (or the owner, under the owner-only policy)
    /// has confirmed the final files.
    pub fn final_transfer_complete(&self) -> bool {
        let Some(list) = &self.final_transfer_list else {
            return true;
        };
        let owner_done = self.limit_output_to_owner
            && self.owner.as_ref().is_some_and(|owner| list.contains(owner));
        owner_done || self.clients.keys().all(|id| list.contains(id))
    }
}

/// Emit the merged progress snapshot to the run's listeners.
pub fn publish_state(run: &ActiveRun) {
    let _ = run.events.send(Event::StateUpdate {
        run_id: run.run_id.clone(),
        snapshot: Box::new(run.state_snapshot()),
    });
}

/// Transition the run to Running and emit an update.
pub fn start_run(run: &mut ActiveRun) {
    run.state = RunState::Running;
    publish_state(run);
}

/// Mark the run as finished and emit the completion event.
pub fn complete_run(run: &mut ActiveRun, output: &Value) {
    run.state = RunState::Finished;
    run.state_status = Some("Pipeline finished".to_string());
    publish_state(run);
    let _ = run.events.send(Event::RunCompleted {
        run_id: run.run_id.clone(),
        output: output.clone(),
    });
}

/// Mark the run as failed, record the error and emit the failure event.
pub fn fail_run(run: &mut ActiveRun, error: RunError) {
    run.state = RunState::Error;
    run.error = Some(error.clone());
    publish_state(run);
    let _ = run.events.send(Event::RunFailed {
        run_id: run.run_id.clone(),
        error,
    });
}

/// Update the awaited participants and emit an update if they changed.
pub fn set_waiting_on(run: &mut ActiveRun, waiting_on: Vec<String>) {
    if run.waiting_on != waiting_on {
        run.waiting_on = waiting_on;
        publish_state(run);
    }
}
