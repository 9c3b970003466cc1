//! Central-node half of the coordination protocol.
//!
//! The central node gathers every peer's result for an iteration behind a
//! barrier, runs its own computation on the group and sends the result
//! back. Files travel over the HTTP side-channel: peers upload their parts
//! to the central file server and download the central node's parts from
//! it.

use crate::engine::controller::{RemoteKind, RemoteReply, RemoteRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::network::archive::{create_archive, extract_parts, stage_transfer, ArchiveOptions};
use crate::network::bus::{publish_json, Qos};
use crate::network::file_server::TransferHandler;
use crate::state::manager::{now_millis, ManagerInner, RemoteWait};
use crate::state::run::{clear_directory, set_waiting_on, start_run, RegistrationState, RemoteClient};
use crate::state::store::StoreValue;
use async_trait::async_trait;
use dcp_protocol::config_models::NodeRole;
use dcp_protocol::messages::{
    topics, CentralRunMessage, DebugTimes, FinishedMessage, MessageError, PeerRunMessage,
    RegisterAck, RegisterMessage, RunPayload,
};
use dcp_protocol::run_models::{RunError, RunState};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

const NO_SUCH_RUN: &str = "Remote has no such pipeline run";

/// Placeholder non-owners receive when the output is owner-only.
pub const OWNER_ONLY_MESSAGE: &str = "output sent to consortium owner";

/// Where the central file server keeps and serves parts.
///
/// Uploads land in `{base}/{clientId}` of the run, downloads are served
/// from the run's system directory.
pub(crate) struct CentralTransfer {
    pub(crate) inner: Weak<ManagerInner>,
}

#[async_trait]
impl TransferHandler for CentralTransfer {
    fn upload_directory(&self, client_id: &str, run_id: &str) -> Option<PathBuf> {
        let inner = self.inner.upgrade()?;
        let runs = inner.active_runs.lock();
        let run = runs.get(run_id)?;
        run.clients
            .contains_key(client_id)
            .then(|| run.directories.base.join(client_id))
    }

    async fn part_received(&self, client_id: &str, run_id: &str, filename: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.part_received(client_id, run_id, filename);
        }
    }

    fn download_directory(&self, run_id: &str) -> Option<PathBuf> {
        let inner = self.inner.upgrade()?;
        let runs = inner.active_runs.lock();
        runs.get(run_id).map(|run| run.directories.system.clone())
    }
}

/// How an incoming peer result relates to its run.
enum Admission {
    NoSuchRun,
    Errored(RunError, Vec<String>),
    Open {
        username: String,
        step: usize,
        current: u64,
        released: Option<(usize, u64)>,
    },
}

impl ManagerInner {
    /// Perform the network half of a central controller tick.
    pub(crate) async fn central_remote(self: &Arc<Self>, request: RemoteRequest) -> PipelineResult<RemoteWait> {
        let run_id = request.run_id.as_str();
        match request.kind {
            RemoteKind::FirstServerRemote => {
                let rx = {
                    let mut runs = self.active_runs.lock();
                    let run = runs.get_mut(run_id).ok_or_else(|| Self::unknown_run(run_id))?;
                    let rx = run.remote.arm();
                    if run.state == RunState::Created {
                        start_run(run);
                    }
                    rx
                };
                self.acknowledge_clients(run_id).await;
                for (message, received) in self.take_early_messages(run_id) {
                    self.on_peer_run(message, received).await;
                }
                self.update_barrier(run_id).await;
                Ok(RemoteWait::Pending(rx))
            }
            RemoteKind::Remote => {
                let rx = self.arm_remote(run_id)?;
                self.central_communicate(run_id, request.success, request.iteration)
                    .await?;
                Ok(RemoteWait::Pending(rx))
            }
            RemoteKind::DoneRemote => {
                self.central_communicate(run_id, true, request.iteration)
                    .await?;
                Ok(RemoteWait::Ready(RemoteReply {
                    success: true,
                    received: None,
                }))
            }
        }
    }

    /// Held peer results that belong to the step now running.
    fn take_early_messages(&self, run_id: &str) -> Vec<(PeerRunMessage, i64)> {
        let mut runs = self.active_runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return Vec::new();
        };
        let step = run.pipeline.current_step();
        run.early_messages.retain(|(message, _)| message.step >= step);
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut run.early_messages)
            .into_iter()
            .partition(|(message, _)| message.step == step);
        run.early_messages = later;
        due
    }

    /// Confirm the registration of every client of the run.
    pub(crate) async fn acknowledge_clients(&self, run_id: &str) {
        let clients: Vec<String> = self
            .active_runs
            .lock()
            .get(run_id)
            .map(|run| run.clients.keys().cloned().collect())
            .unwrap_or_default();

        let ack = RegisterAck {
            run_id: run_id.to_string(),
        };
        for client_id in &clients {
            let topic = topics::participant_register(client_id);
            if let Err(e) = publish_json(self.bus.as_ref(), &topic, &ack, Qos::AtMostOnce).await {
                warn!(%run_id, %client_id, "Failed to acknowledge registration: {e}");
            }
        }

        let mut remote_clients = self.remote_clients.lock();
        for client_id in &clients {
            if let Some(client) = remote_clients.get_mut(client_id) {
                client.state = RegistrationState::Registered;
            }
        }
    }

    /// Send this node's pending result to every client.
    async fn central_communicate(&self, run_id: &str, success: bool, iteration: u64) -> PipelineResult<()> {
        let directories = self.run_directories(run_id)?;
        let step = self.current_step(run_id)?;

        let output = match self.store.get_and_remove(run_id, self.participant_id()) {
            Some(StoreValue::Error(error)) => {
                let error = error.annotate("Pipeline error from central node");
                let clients = {
                    let mut runs = self.active_runs.lock();
                    let run = runs.get_mut(run_id).ok_or_else(|| Self::unknown_run(run_id))?;
                    run.state = RunState::Error;
                    run.state_status = Some("Central node error".to_string());
                    run.error = Some(error.clone());
                    run.clients.keys().cloned().collect::<Vec<_>>()
                };
                self.broadcast_error(run_id, &clients, &error).await;
                return Err(PipelineError::Remote(error));
            }
            Some(StoreValue::Output(output)) => output,
            None => Value::Null,
        };

        let staged = stage_transfer(&directories.transfer, &directories.system).await?;
        let files = if staged.is_empty() {
            None
        } else {
            let parts = create_archive(ArchiveOptions {
                source: directories.system.clone(),
                entries: staged,
                destination: directories.system.clone(),
                name: format!("{run_id}-{}-tempOutput.tar.gz", Uuid::new_v4()),
                chunk_size: self.config.transfer.chunk_size,
                compression_level: self.config.transfer.compression_level,
            })
            .await?;
            Some(parts)
        };

        if success && files.is_some() {
            if let Some(run) = self.active_runs.lock().get_mut(run_id) {
                run.final_transfer_list = Some(BTreeSet::new());
            }
        }

        debug!(%run_id, step, iteration, success, "Sending central output");
        let message = CentralRunMessage {
            run_id: run_id.to_string(),
            output: Some(output),
            error: None,
            success,
            files,
            step,
            iteration: Some(iteration),
            debug: DebugTimes::sent_at(now_millis()),
        };
        self.client_publish(run_id, &message).await
    }

    /// Publish `message` to every client, honoring the owner-only policy.
    async fn client_publish(&self, run_id: &str, message: &CentralRunMessage) -> PipelineResult<()> {
        let (clients, owner, limit_output_to_owner) = {
            let runs = self.active_runs.lock();
            let run = runs.get(run_id).ok_or_else(|| Self::unknown_run(run_id))?;
            (
                run.clients.keys().cloned().collect::<Vec<_>>(),
                run.owner.clone(),
                run.limit_output_to_owner,
            )
        };

        let owner_only = limit_output_to_owner && message.success;
        for client_id in &clients {
            let is_owner = owner.as_deref() == Some(client_id.as_str());
            let topic = topics::participant_run(client_id);
            if owner_only && !is_owner {
                let redacted = CentralRunMessage {
                    output: Some(json!({ "message": OWNER_ONLY_MESSAGE })),
                    files: None,
                    ..message.clone()
                };
                publish_json(self.bus.as_ref(), &topic, &redacted, Qos::AtMostOnce).await?;
            } else {
                let qos = if owner_only {
                    Qos::AtLeastOnce
                } else {
                    Qos::AtMostOnce
                };
                publish_json(self.bus.as_ref(), &topic, message, qos).await?;
            }
        }
        Ok(())
    }

    /// Clients the run is still waiting on for the current iteration.
    pub(crate) fn compute_waiting_on(&self, run_id: &str) -> Option<Vec<String>> {
        let runs = self.active_runs.lock();
        let run = runs.get(run_id)?;
        if self.config.role != NodeRole::Central {
            return Some(Vec::new());
        }
        let clients = self.remote_clients.lock();
        Some(
            run.clients
                .keys()
                .filter(|client_id| {
                    clients
                        .get(*client_id)
                        .and_then(|client| client.runs.get(run_id))
                        .is_some_and(|client_run| {
                            !self.store.has(run_id, client_id) || client_run.files.pending()
                        })
                })
                .cloned()
                .collect(),
        )
    }

    /// Publish the waiting-on set and release the barrier once it is empty.
    pub(crate) async fn update_barrier(&self, run_id: &str) {
        let Some(waiting_on) = self.compute_waiting_on(run_id) else {
            return;
        };

        let release = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return;
            };
            set_waiting_on(run, waiting_on.clone());
            let round = (run.pipeline.current_step(), run.pipeline.current_iteration());
            let open = waiting_on.is_empty()
                && run.state == RunState::Running
                && run.error.is_none()
                && run.released != Some(round);
            if open {
                run.released = Some(round);
                run.state_status = Some("Received all node data".to_string());
                Some((
                    run.directories.system.clone(),
                    run.clients.keys().cloned().collect::<Vec<_>>(),
                    round.1,
                ))
            } else {
                None
            }
        };

        let Some((system, clients, iteration)) = release else {
            if !waiting_on.is_empty() {
                debug!(%run_id, ?waiting_on, "Waiting on clients");
            }
            return;
        };

        {
            let mut remote_clients = self.remote_clients.lock();
            for client_id in &clients {
                let Some(client_run) = remote_clients
                    .get_mut(client_id)
                    .and_then(|client| client.runs.get_mut(run_id))
                else {
                    continue;
                };
                client_run.files.clear();
                if let (Some(sent), Some(received)) = (client_run.debug.sent, client_run.debug.received) {
                    debug!(
                        target: "dcp::profile",
                        %run_id,
                        %client_id,
                        iteration,
                        "Transmission to the central node took {}ms",
                        received - sent
                    );
                }
            }
        }

        if let Err(e) = clear_directory(&system).await {
            warn!(%run_id, "Failed to clear system directory: {e}");
        }

        info!(%run_id, iteration, "Received all node data");
        self.resolve_remote(
            run_id,
            Ok(RemoteReply {
                success: false,
                received: Some(now_millis()),
            }),
        );
    }

    /// Handle a `run` message from a peer.
    pub(crate) async fn on_peer_run(self: &Arc<Self>, message: PeerRunMessage, received: i64) {
        let run_id = message.run_id.clone();
        let client_id = message.id.clone();

        let admission = {
            let runs = self.active_runs.lock();
            match runs.get(&run_id) {
                Some(run) => match (run.clients.get(&client_id), &run.error) {
                    (None, _) => Admission::NoSuchRun,
                    (Some(_), Some(error)) => {
                        Admission::Errored(error.clone(), run.clients.keys().cloned().collect())
                    }
                    (Some(username), None) => Admission::Open {
                        username: username.clone(),
                        step: run.pipeline.current_step(),
                        current: run.pipeline.current_iteration(),
                        released: run.released,
                    },
                },
                None => Admission::NoSuchRun,
            }
        };

        let (username, step, current, released) = match admission {
            Admission::NoSuchRun => {
                warn!(%run_id, %client_id, "Run message for an unknown run");
                let reply = CentralRunMessage::error(run_id.clone(), RunError::new(NO_SUCH_RUN));
                let topic = topics::participant_run(&client_id);
                if let Err(e) = publish_json(self.bus.as_ref(), &topic, &reply, Qos::AtMostOnce).await {
                    warn!(%run_id, %client_id, "Failed to reject run message: {e}");
                }
                return;
            }
            Admission::Errored(error, clients) => {
                self.broadcast_error(&run_id, &clients, &error).await;
                return;
            }
            Admission::Open {
                username,
                step,
                current,
                released,
            } => (username, step, current, released),
        };

        let output = match message.payload() {
            Ok(RunPayload::Output(output)) => output,
            Ok(RunPayload::Error(error)) => {
                return self.client_failed(&run_id, &client_id, &username, error).await;
            }
            Err(MessageError::Malformed { reason, .. }) => {
                let error = RunError::new(reason);
                return self.client_failed(&run_id, &client_id, &username, error).await;
            }
            Err(other) => {
                let error = RunError::new(other.to_string());
                return self.client_failed(&run_id, &client_id, &username, error).await;
            }
        };

        // Peers move on as soon as they have the final result of a step,
        // which can be before this node has started the next one.
        if message.step > step {
            debug!(%run_id, %client_id, step = message.step, "Holding run message for a later step");
            if let Some(run) = self.active_runs.lock().get_mut(&run_id) {
                run.early_messages.push((message, received));
            }
            return;
        }

        let iteration = message.iteration.unwrap_or(0);
        if message.step < step
            || iteration != current + 1
            || self.store.has(&run_id, &client_id)
            || released == Some((step, current))
        {
            debug!(
                %run_id,
                %client_id,
                step = message.step,
                iteration,
                current,
                "Ignoring stale or duplicate run message"
            );
            return;
        }

        {
            let mut remote_clients = self.remote_clients.lock();
            if let Some(client_run) = remote_clients
                .get_mut(&client_id)
                .and_then(|client| client.runs.get_mut(&run_id))
            {
                client_run.debug = DebugTimes {
                    sent: message.debug.sent,
                    received: Some(received),
                };
                if let Some(sent) = message.debug.sent {
                    *client_run
                        .profiling
                        .entry("transmission".to_string())
                        .or_default() += received - sent;
                }
                if let Some(files) = &message.files {
                    client_run.files.expected.extend(files.iter().cloned());
                }
            }
        }

        debug!(%run_id, %client_id, iteration, "Received client data");
        self.store.put(&run_id, &client_id, StoreValue::Output(output));
        if message.files.is_some() {
            self.try_finalize_files(&run_id, &client_id);
        }
        self.update_barrier(&run_id).await;
    }

    /// Fail the run because a client reported an error.
    async fn client_failed(&self, run_id: &str, client_id: &str, username: &str, error: RunError) {
        let error = error.annotate(&format!("Pipeline error from pipeline {run_id} user: {username}"));
        warn!(%run_id, %client_id, "Client error: {}", error.message);

        let clients = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return;
            };
            run.state_status = Some("Received client error".to_string());
            run.error = Some(error.clone());
            run.clients.keys().cloned().collect::<Vec<_>>()
        };
        self.broadcast_error(run_id, &clients, &error).await;
        self.resolve_remote(run_id, Err(PipelineError::Remote(error)));
    }

    /// Fail the run because of a local error while handling peer data.
    async fn central_failed(&self, run_id: &str, error: PipelineError) {
        let run_error = error.to_run_error().annotate("Pipeline error from central node");
        warn!(%run_id, "Central node error: {}", run_error.message);

        let clients = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return;
            };
            run.state_status = Some("Central node error".to_string());
            run.error = Some(run_error.clone());
            run.clients.keys().cloned().collect::<Vec<_>>()
        };
        self.broadcast_error(run_id, &clients, &run_error).await;
        self.resolve_remote(run_id, Err(PipelineError::Remote(run_error)));
    }

    /// Record an uploaded part.
    pub(crate) fn part_received(self: &Arc<Self>, client_id: &str, run_id: &str, filename: &str) {
        {
            let mut remote_clients = self.remote_clients.lock();
            let Some(client_run) = remote_clients
                .get_mut(client_id)
                .and_then(|client| client.runs.get_mut(run_id))
            else {
                return;
            };
            if !client_run.files.received.iter().any(|f| f == filename) {
                client_run.files.received.push(filename.to_string());
            }
        }
        self.try_finalize_files(run_id, client_id);
    }

    /// Unpack a client's archive once its message and every part arrived.
    fn try_finalize_files(self: &Arc<Self>, run_id: &str, client_id: &str) {
        let (dir, parts) = {
            let runs = self.active_runs.lock();
            let Some(run) = runs.get(run_id) else {
                return;
            };
            let mut remote_clients = self.remote_clients.lock();
            let Some(client_run) = remote_clients
                .get_mut(client_id)
                .and_then(|client| client.runs.get_mut(run_id))
            else {
                return;
            };
            let files = &mut client_run.files;
            if files.expected.is_empty() || files.unpacked || files.unpacking || !files.all_received() {
                return;
            }
            files.unpacking = true;
            (run.directories.base.join(client_id), files.expected.clone())
        };

        let inner = Arc::clone(self);
        let run_id = run_id.to_string();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            let started = now_millis();
            match extract_parts(&dir, &parts, &dir).await {
                Ok(()) => {
                    {
                        let mut remote_clients = inner.remote_clients.lock();
                        if let Some(client_run) = remote_clients
                            .get_mut(&client_id)
                            .and_then(|client| client.runs.get_mut(&run_id))
                        {
                            client_run.files.unpacking = false;
                            client_run.files.unpacked = true;
                            *client_run
                                .profiling
                                .entry("unpacking".to_string())
                                .or_default() += now_millis() - started;
                        }
                    }
                    debug!(%run_id, %client_id, parts = parts.len(), "Unpacked client files");
                    inner.update_barrier(&run_id).await;
                }
                Err(error) => inner.central_failed(&run_id, error).await,
            }
        });
    }

    /// Handle a `register` message.
    pub(crate) async fn on_register(&self, message: RegisterMessage) {
        let RegisterMessage { id, run_id } = message;
        let acknowledge = {
            let runs = self.active_runs.lock();
            let open = runs
                .get(&run_id)
                .is_some_and(|run| run.state != RunState::Created);
            let mut remote_clients = self.remote_clients.lock();
            let client = remote_clients
                .entry(id.clone())
                .or_insert_with(|| RemoteClient::new(&id, &id, RegistrationState::Unregistered));
            client.runs.entry(run_id.clone()).or_default();
            if open {
                client.state = RegistrationState::Registered;
            } else if client.state == RegistrationState::Unregistered {
                client.state = RegistrationState::PreRegistered;
            }
            open
        };

        if acknowledge {
            let ack = RegisterAck {
                run_id: run_id.clone(),
            };
            let topic = topics::participant_register(&id);
            if let Err(e) = publish_json(self.bus.as_ref(), &topic, &ack, Qos::AtMostOnce).await {
                warn!(%run_id, client_id = %id, "Failed to acknowledge registration: {e}");
            }
        } else {
            debug!(%run_id, client_id = %id, "Client pre-registered");
        }
    }

    /// Handle a `finished` message.
    pub(crate) async fn on_finished(&self, message: FinishedMessage) {
        let FinishedMessage { id, run_id } = message;
        let complete = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(&run_id) else {
                return;
            };
            if !run.clients.contains_key(&id) {
                return;
            }
            let Some(list) = run.final_transfer_list.as_mut() else {
                return;
            };
            list.insert(id.clone());
            run.state == RunState::Finished && run.final_transfer_complete()
        };

        debug!(%run_id, client_id = %id, "Client fetched the final files");
        if complete {
            self.cleanup(&run_id).await;
        }
    }
}
