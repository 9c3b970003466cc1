//! Pipeline manager for coordinating the runs of one node.
//!
//! The PipelineManager is the central orchestrator for all pipeline runs a
//! node takes part in. It maintains the registry of active runs, bridges
//! every run's controllers to the message bus and answers the
//! start/stop/suspend/listen API.
//!
//! The role-specific halves of the coordination protocol live in
//! [`crate::network::central`] and [`crate::network::outer`].

use crate::computation::registry::ComputationRegistry;
use crate::engine::controller::{RemoteHandler, RemoteReply, RemoteRequest, StopOutcome};
use crate::engine::{Pipeline, PipelineHandle, PipelineOptions};
use crate::error::{PipelineError, PipelineResult};
use crate::network::bus::{publish_json, BusMessage, MessageBus, Qos};
use crate::network::central::CentralTransfer;
use crate::network::file_server;
use crate::network::mqtt::MqttBus;
use crate::network::transfer::TransferClient;
use crate::state::run::{
    complete_run, fail_run, publish_state, start_run, ActiveRun, ActiveRunOptions, RegistrationState,
    RemoteClient, RemoteResult, RunDirectories,
};
use crate::state::store::RunStore;
use async_trait::async_trait;
use dcp_protocol::config_models::{ManagerConfig, NodeRole};
use dcp_protocol::controller_models::{ExecutionMode, StopKind};
use dcp_protocol::ipc::Event;
use dcp_protocol::messages::{
    topics, CentralRunMessage, DebugTimes, InboundMessage, PeerRunMessage, RegisterMessage,
};
use dcp_protocol::pipeline_models::PipelineSpec;
use dcp_protocol::run_models::{RunError, RunState, RunStateSnapshot, SuspendedRun};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Headroom on top of one archive part for the multipart envelope.
const UPLOAD_OVERHEAD: usize = 1024 * 1024;

/// Milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Arguments of [`PipelineManager::start_pipeline`].
#[derive(Debug, Clone)]
pub struct StartPipelineOptions {
    pub spec: PipelineSpec,
    /// Participant id to display name. Only the central node uses it.
    pub clients: BTreeMap<String, String>,
    pub run_id: String,
    /// Read input data from here instead of the run's base directory.
    pub alternate_input_directory: Option<PathBuf>,
    /// Token returned by an earlier suspend.
    pub save_state: Option<SuspendedRun>,
}

impl StartPipelineOptions {
    pub fn new(spec: PipelineSpec, run_id: impl Into<String>) -> Self {
        Self {
            spec,
            clients: BTreeMap::new(),
            run_id: run_id.into(),
            alternate_input_directory: None,
            save_state: None,
        }
    }

    pub fn with_client(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.clients.insert(id.into(), name.into());
        self
    }

    pub fn with_save_state(mut self, token: SuspendedRun) -> Self {
        self.save_state = Some(token);
        self
    }

    pub fn with_input_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.alternate_input_directory = Some(path.into());
        self
    }
}

/// A run that has been started.
pub struct StartedPipeline {
    pub run_id: String,
    pub handle: PipelineHandle,
    /// Progress events, subscribed before the run began.
    pub events: broadcast::Receiver<Event>,
    pub task: JoinHandle<PipelineResult<Value>>,
}

impl StartedPipeline {
    /// Wait for the run and return the last step's output.
    ///
    /// # Errors
    ///
    /// Returns the error the run failed with.
    pub async fn result(self) -> PipelineResult<Value> {
        self.task
            .await
            .map_err(|e| PipelineError::Protocol(format!("Run task of {} failed: {e}", self.run_id)))?
    }
}

/// What a network round-trip resolved into before waiting.
pub(crate) enum RemoteWait {
    Ready(RemoteReply),
    Pending(oneshot::Receiver<RemoteResult>),
}

/// Registries shared by the manager, its run tasks and its network handlers.
///
/// Lock order: `active_runs` before `remote_clients`. Neither is held
/// across an `.await`.
pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    pub(crate) store: RunStore,
    registry: ComputationRegistry,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) active_runs: Mutex<HashMap<String, ActiveRun>>,
    pub(crate) remote_clients: Mutex<HashMap<String, RemoteClient>>,
    pub(crate) transfer: Option<TransferClient>,
    file_server_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl ManagerInner {
    pub(crate) fn participant_id(&self) -> &str {
        &self.config.participant_id
    }

    pub(crate) fn unknown_run(run_id: &str) -> PipelineError {
        PipelineError::UnknownRun(run_id.to_string())
    }

    /// Start waiting on the network for `run_id`.
    pub(crate) fn arm_remote(&self, run_id: &str) -> PipelineResult<oneshot::Receiver<RemoteResult>> {
        let mut runs = self.active_runs.lock();
        let run = runs.get_mut(run_id).ok_or_else(|| Self::unknown_run(run_id))?;
        Ok(run.remote.arm())
    }

    pub(crate) fn run_directories(&self, run_id: &str) -> PipelineResult<RunDirectories> {
        self.active_runs
            .lock()
            .get(run_id)
            .map(|run| run.directories.clone())
            .ok_or_else(|| Self::unknown_run(run_id))
    }

    /// Index of the step `run_id` is running.
    pub(crate) fn current_step(&self, run_id: &str) -> PipelineResult<usize> {
        self.active_runs
            .lock()
            .get(run_id)
            .map(|run| run.pipeline.current_step())
            .ok_or_else(|| Self::unknown_run(run_id))
    }

    /// Hand `result` to whatever waits on the network for `run_id`.
    pub(crate) fn resolve_remote(&self, run_id: &str, result: RemoteResult) {
        if let Some(run) = self.active_runs.lock().get_mut(run_id) {
            run.remote.resolve(result);
        }
    }

    async fn handle_message(self: &Arc<Self>, message: InboundMessage, received: i64) {
        match message {
            InboundMessage::Register(message) => self.on_register(message).await,
            InboundMessage::PeerRun(message) => self.on_peer_run(message, received).await,
            InboundMessage::Finished(message) => self.on_finished(message).await,
            InboundMessage::RegisterAck(ack) => self.on_register_ack(ack),
            InboundMessage::CentralRun(message) => {
                // Downloads can take long; keep the bus moving.
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.on_central_run(message, received).await });
            }
        }
    }

    /// Move the run to `Running` once its first step begins. A central node
    /// with decentralized steps waits for `firstServerRemote` instead.
    fn begin_run(&self, run_id: &str, decentralized: bool) {
        if self.config.role == NodeRole::Central && decentralized {
            return;
        }
        if let Some(run) = self.active_runs.lock().get_mut(run_id) {
            if run.state == RunState::Created {
                start_run(run);
            }
        }
    }

    /// Record the outcome of a run and tear it down.
    async fn finish_run(&self, run_id: &str, result: PipelineResult<Value>) -> PipelineResult<Value> {
        match result {
            Ok(output) => {
                let cleanup_now = {
                    let mut runs = self.active_runs.lock();
                    match runs.get_mut(run_id) {
                        Some(run) => {
                            complete_run(run, &output);
                            run.final_transfer_complete()
                        }
                        None => false,
                    }
                };
                info!(%run_id, "Pipeline finished");
                self.log_profiling_totals(run_id);
                if cleanup_now {
                    self.cleanup(run_id).await;
                } else {
                    debug!(%run_id, "Keeping run until peers fetch the final files");
                }
                Ok(output)
            }
            Err(error) => {
                let run_error = error.to_run_error();
                let pending = {
                    let runs = self.active_runs.lock();
                    runs.get(run_id).map(|run| {
                        (run.error.is_none(), run.clients.keys().cloned().collect::<Vec<_>>())
                    })
                };

                if error.is_stop() {
                    info!(%run_id, "Pipeline halted: {error}");
                } else {
                    error!(%run_id, "Pipeline failed: {error}");
                }

                if let Some((true, clients)) = pending {
                    self.publish_failure(run_id, &clients, &run_error).await;
                }
                if let Some(run) = self.active_runs.lock().get_mut(run_id) {
                    let reported = run.error.clone().unwrap_or(run_error);
                    fail_run(run, reported);
                }
                self.cleanup(run_id).await;
                Err(error)
            }
        }
    }

    /// Tell the other side that this node's run failed.
    async fn publish_failure(&self, run_id: &str, clients: &[String], error: &RunError) {
        match self.config.role {
            NodeRole::Central => self.broadcast_error(run_id, clients, error).await,
            NodeRole::Peer => {
                let message = PeerRunMessage {
                    id: self.participant_id().to_string(),
                    run_id: run_id.to_string(),
                    output: None,
                    error: Some(error.clone()),
                    files: None,
                    step: self.current_step(run_id).unwrap_or(0),
                    iteration: None,
                    debug: DebugTimes::sent_at(now_millis()),
                };
                if let Err(e) =
                    publish_json(self.bus.as_ref(), topics::RUN, &message, Qos::AtLeastOnce).await
                {
                    warn!(%run_id, "Failed to report run error: {e}");
                }
            }
        }
    }

    /// Send `error` to every client of the run.
    pub(crate) async fn broadcast_error(&self, run_id: &str, clients: &[String], error: &RunError) {
        let message = CentralRunMessage::error(run_id, error.clone());
        for client_id in clients {
            let topic = topics::participant_run(client_id);
            if let Err(e) = publish_json(self.bus.as_ref(), &topic, &message, Qos::AtMostOnce).await {
                warn!(%run_id, %client_id, "Failed to send run error: {e}");
            }
        }
    }

    /// Forget a run and remove its scratch directories. Repeated calls are
    /// harmless.
    pub(crate) async fn cleanup(&self, run_id: &str) {
        let Some(run) = self.active_runs.lock().remove(run_id) else {
            return;
        };
        if let Err(e) = run.directories.remove_scratch().await {
            warn!(%run_id, "Pipeline cleanup failure: {e}");
        }
        self.store.remove_group(run_id);
        for client in self.remote_clients.lock().values_mut() {
            client.runs.remove(run_id);
        }
        debug!(%run_id, "Run cleaned up");
    }

    fn log_profiling_totals(&self, run_id: &str) {
        if self.config.role != NodeRole::Central {
            return;
        }
        let runs = self.active_runs.lock();
        let Some(run) = runs.get(run_id) else {
            return;
        };
        let clients = self.remote_clients.lock();
        for client_id in run.clients.keys() {
            let Some(client_run) = clients.get(client_id).and_then(|c| c.runs.get(run_id)) else {
                continue;
            };
            for (task, total) in &client_run.profiling {
                info!(target: "dcp::profile", %run_id, %client_id, "Total {task} time took {total}ms");
            }
        }
    }
}

/// Network bridge handed to the controllers of one run.
struct RunRemote {
    inner: Weak<ManagerInner>,
    run_id: String,
}

#[async_trait]
impl RemoteHandler for RunRemote {
    async fn handle(&self, request: RemoteRequest) -> PipelineResult<RemoteReply> {
        let wait = {
            let inner = self.inner.upgrade().ok_or_else(|| {
                PipelineError::Protocol("Pipeline manager has shut down".to_string())
            })?;
            match inner.config.role {
                NodeRole::Central => inner.central_remote(request).await?,
                NodeRole::Peer => inner.peer_remote(request).await?,
            }
        };

        match wait {
            RemoteWait::Ready(reply) => Ok(reply),
            RemoteWait::Pending(rx) => rx.await.map_err(|_| {
                PipelineError::Protocol(format!(
                    "Run {} was torn down while waiting on the network",
                    self.run_id
                ))
            })?,
        }
    }
}

async fn dispatch(inner: Weak<ManagerInner>, mut incoming: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(message) = incoming.recv().await {
        let received = now_millis();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match InboundMessage::decode(&message.topic, inner.participant_id(), &message.payload) {
            Ok(decoded) => inner.handle_message(decoded, received).await,
            Err(e) => warn!("Dropping bus message: {e}"),
        }
    }
    debug!("Message dispatch stopped");
}

/// Owns every active run of one node.
///
/// Clones share the same registries, so the manager can be handed to
/// several tasks.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<ManagerInner>,
}

impl PipelineManager {
    /// Connect to the MQTT broker of `config` and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriptions or the central file server
    /// cannot be set up.
    pub async fn create(config: ManagerConfig, registry: ComputationRegistry) -> PipelineResult<Self> {
        let (bus, incoming) = MqttBus::connect(&config.broker, &config.participant_id);
        Self::with_bus(config, registry, bus, incoming).await
    }

    /// Start serving over an existing bus connection.
    ///
    /// # Arguments
    ///
    /// * `config` - Role, identity, working directory and transfer settings
    /// * `registry` - Resolves the computation units of every step
    /// * `bus` - Connection used to publish and subscribe
    /// * `incoming` - Messages delivered to `bus`
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Bus` if a subscription fails and
    /// `PipelineError::NetworkTransfer` if the central file server cannot
    /// bind its port.
    pub async fn with_bus(
        config: ManagerConfig,
        registry: ComputationRegistry,
        bus: Arc<dyn MessageBus>,
        incoming: mpsc::UnboundedReceiver<BusMessage>,
    ) -> PipelineResult<Self> {
        let transfer = (config.role == NodeRole::Peer)
            .then(|| TransferClient::new(&config.file_server, &config.transfer));

        let inner = Arc::new(ManagerInner {
            config,
            store: RunStore::new(),
            registry,
            bus,
            active_runs: Mutex::new(HashMap::new()),
            remote_clients: Mutex::new(HashMap::new()),
            transfer,
            file_server_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        match inner.config.role {
            NodeRole::Central => {
                for topic in [topics::REGISTER, topics::RUN, topics::FINISHED] {
                    inner.bus.subscribe(topic).await?;
                }

                let server = &inner.config.file_server;
                let listener = TcpListener::bind((server.host.as_str(), server.port))
                    .await
                    .map_err(|e| {
                        PipelineError::NetworkTransfer(format!(
                            "Unable to start file server on {}:{}: {e}",
                            server.host, server.port
                        ))
                    })?;
                let handler = Arc::new(CentralTransfer {
                    inner: Arc::downgrade(&inner),
                });
                let router = file_server::router(
                    handler,
                    &server.pathname,
                    inner.config.transfer.chunk_size + UPLOAD_OVERHEAD,
                );
                let (addr, task) = file_server::serve(listener, router);
                info!(%addr, "File server listening");
                *inner.file_server_addr.lock() = Some(addr);
                inner.tasks.lock().push(task);
            }
            NodeRole::Peer => {
                let id = inner.participant_id().to_string();
                inner.bus.subscribe(&topics::participant_register(&id)).await?;
                inner.bus.subscribe(&topics::participant_run(&id)).await?;
            }
        }

        let task = tokio::spawn(dispatch(Arc::downgrade(&inner), incoming));
        inner.tasks.lock().push(task);

        info!(
            role = ?inner.config.role,
            participant_id = %inner.config.participant_id,
            "Pipeline manager ready"
        );
        Ok(Self { inner })
    }

    pub fn participant_id(&self) -> &str {
        self.inner.participant_id()
    }

    pub fn role(&self) -> NodeRole {
        self.inner.config.role
    }

    /// Address the central file server is bound to.
    pub fn file_server_addr(&self) -> Option<SocketAddr> {
        *self.inner.file_server_addr.lock()
    }

    /// Ids of the runs currently held by this manager.
    pub fn active_run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.active_runs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merged pipeline and manager progress of a run.
    pub fn run_state(&self, run_id: &str) -> Option<RunStateSnapshot> {
        self.inner
            .active_runs
            .lock()
            .get(run_id)
            .map(ActiveRun::state_snapshot)
    }

    /// Start a run in the background.
    ///
    /// The working directories are created and, on a peer, the run is
    /// announced to the central node before this returns.
    ///
    /// # Returns
    ///
    /// The started run: a handle on its progress, its event stream and the
    /// task resolving to its final output.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRun` if `run_id` is already active, `Directory` if
    /// the working directories cannot be created, and `InvalidSpec` or
    /// `Computation` if the pipeline cannot be built.
    pub async fn start_pipeline(&self, options: StartPipelineOptions) -> PipelineResult<StartedPipeline> {
        let inner = &self.inner;
        let run_id = options.run_id.clone();
        if inner.active_runs.lock().contains_key(&run_id) {
            return Err(PipelineError::DuplicateRun(run_id));
        }

        let role = inner.config.role;
        let mode = match role {
            NodeRole::Central => ExecutionMode::Remote,
            NodeRole::Peer => ExecutionMode::Local,
        };
        let directories = RunDirectories::for_participant(
            &inner.config.working_directory,
            inner.participant_id(),
            &run_id,
        );
        directories.create_all().await?;

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let created = Pipeline::create(
            &options.spec,
            PipelineOptions {
                run_id: run_id.clone(),
                participant_id: inner.participant_id().to_string(),
                mode,
                directories: directories.clone(),
                input_directory: options.alternate_input_directory.clone(),
                store: inner.store.clone(),
                registry: inner.registry.clone(),
                updates: Some(updates_tx),
                resume: options.save_state.clone(),
            },
        );
        let pipeline = match created {
            Ok(pipeline) => pipeline,
            Err(error) => {
                if let Err(e) = directories.remove_scratch().await {
                    warn!(%run_id, "Pipeline cleanup failure: {e}");
                }
                return Err(error);
            }
        };
        let handle = pipeline.handle();
        let decentralized = options.spec.is_decentralized();

        let mut run = ActiveRun::new(ActiveRunOptions {
            run_id: run_id.clone(),
            mode,
            directories,
            clients: options.clients.clone(),
            owner: options.spec.owner.clone(),
            limit_output_to_owner: options.spec.limit_output_to_owner,
            pipeline: handle.clone(),
        });
        let resumed = options.save_state.is_some();
        if let Some(token) = &options.save_state {
            run.state_status = token.active_run_state.state_status.clone();
            // Peers of a resumed run never see firstServerRemote again.
            if role == NodeRole::Central && decentralized {
                run.state = RunState::Running;
            }
        }
        let events = run.events.subscribe();

        if role == NodeRole::Central {
            let mut remote_clients = inner.remote_clients.lock();
            for (id, name) in &options.clients {
                let client = remote_clients
                    .entry(id.clone())
                    .or_insert_with(|| RemoteClient::new(id, name, RegistrationState::Unregistered));
                client.username = name.clone();
                client.runs.entry(run_id.clone()).or_default();
            }
        }

        {
            let mut runs = inner.active_runs.lock();
            match runs.entry(run_id.clone()) {
                Entry::Occupied(_) => return Err(PipelineError::DuplicateRun(run_id)),
                Entry::Vacant(slot) => {
                    let run = slot.insert(run);
                    let _ = run.events.send(Event::RunStarted {
                        run_id: run_id.clone(),
                        total_steps: handle.total_steps(),
                    });
                }
            }
        }
        info!(%run_id, steps = handle.total_steps(), resumed, "Starting pipeline");

        match role {
            NodeRole::Central if resumed && decentralized => inner.acknowledge_clients(&run_id).await,
            NodeRole::Peer if decentralized => {
                let message = RegisterMessage {
                    id: inner.participant_id().to_string(),
                    run_id: run_id.clone(),
                };
                if let Err(e) =
                    publish_json(inner.bus.as_ref(), topics::REGISTER, &message, Qos::AtMostOnce).await
                {
                    inner.cleanup(&run_id).await;
                    return Err(e.into());
                }
            }
            _ => {}
        }

        let weak = Arc::downgrade(inner);
        let forward_id = run_id.clone();
        tokio::spawn(async move {
            while updates_rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Some(run) = inner.active_runs.lock().get(&forward_id) {
                    publish_state(run);
                };
            }
        });

        let remote: Arc<dyn RemoteHandler> = Arc::new(RunRemote {
            inner: Arc::downgrade(inner),
            run_id: run_id.clone(),
        });
        let weak = Arc::downgrade(inner);
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.begin_run(&task_run_id, decentralized);
            }
            let result = pipeline.run(remote).await;
            match weak.upgrade() {
                Some(inner) => inner.finish_run(&task_run_id, result).await,
                None => result,
            }
        });

        Ok(StartedPipeline {
            run_id,
            handle,
            events,
            task,
        })
    }

    /// Ask a run to halt at its next safe point.
    ///
    /// # Returns
    ///
    /// The halted controller's state and pending output, or `None` if the
    /// step ended before it could honor the request.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if `run_id` is not active.
    pub async fn stop_pipeline(&self, run_id: &str, kind: StopKind) -> PipelineResult<Option<StopOutcome>> {
        let controller = {
            let runs = self.inner.active_runs.lock();
            let run = runs.get(run_id).ok_or_else(|| ManagerInner::unknown_run(run_id))?;
            run.pipeline.current_controller().cloned()
        };
        let Some(controller) = controller else {
            return Ok(None);
        };
        info!(%run_id, ?kind, "Stop requested");
        Ok(controller.request_stop(kind).await.ok())
    }

    /// Halt a run and return the token that resumes it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if `run_id` is not active and `Protocol` if the
    /// run ended before reaching a safe point.
    pub async fn suspend_pipeline(&self, run_id: &str) -> PipelineResult<SuspendedRun> {
        let (handle, active_run_state) = {
            let runs = self.inner.active_runs.lock();
            let run = runs.get(run_id).ok_or_else(|| ManagerInner::unknown_run(run_id))?;
            (run.pipeline.clone(), run.snapshot())
        };
        let current_step = handle.current_step();

        let outcome = self
            .stop_pipeline(run_id, StopKind::Suspend)
            .await?
            .ok_or_else(|| {
                PipelineError::Protocol(format!("Run {run_id} ended before it could be suspended"))
            })?;

        Ok(SuspendedRun {
            output: outcome.output,
            controller_state: outcome.controller_state,
            current_step,
            pipeline_cache: handle.cache(),
            active_run_state,
        })
    }

    /// Subscribe to the progress events of a run.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if `run_id` is not active.
    pub fn get_pipeline_state_listener(&self, run_id: &str) -> PipelineResult<broadcast::Receiver<Event>> {
        self.inner
            .active_runs
            .lock()
            .get(run_id)
            .map(|run| run.events.subscribe())
            .ok_or_else(|| ManagerInner::unknown_run(run_id))
    }

    /// Clients the central node still waits on for the current iteration.
    /// Always empty on a peer.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if `run_id` is not active.
    pub fn waiting_on_for_run(&self, run_id: &str) -> PipelineResult<Vec<String>> {
        self.inner
            .compute_waiting_on(run_id)
            .ok_or_else(|| ManagerInner::unknown_run(run_id))
    }
}
