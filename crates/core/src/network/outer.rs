//! Peer-node half of the coordination protocol.
//!
//! A peer computes on its own data, ships each result (and any files its
//! computation staged) to the central node and waits for the aggregate.
//! Results produced before the central node acknowledged the peer's
//! registration are stashed and replayed on acknowledgement.

use crate::engine::controller::{RemoteKind, RemoteReply, RemoteRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::network::archive::{create_archive, extract_parts, stage_transfer, ArchiveOptions};
use crate::network::bus::{publish_json, Qos};
use crate::state::manager::{now_millis, ManagerInner, RemoteWait};
use crate::state::run::{clear_directory, StashedOutput};
use crate::state::store::StoreValue;
use dcp_protocol::messages::{
    topics, CentralRunMessage, DebugTimes, FinishedMessage, PeerRunMessage, RegisterAck,
};
use dcp_protocol::run_models::RunError;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl ManagerInner {
    /// Perform the network half of a peer controller tick.
    pub(crate) async fn peer_remote(self: &Arc<Self>, request: RemoteRequest) -> PipelineResult<RemoteWait> {
        if request.kind != RemoteKind::Remote {
            return Err(PipelineError::Protocol(format!(
                "{:?} is only issued on the central node",
                request.kind
            )));
        }
        let rx = self.arm_remote(&request.run_id)?;
        self.peer_communicate(&request.run_id, request.iteration)
            .await?;
        Ok(RemoteWait::Pending(rx))
    }

    /// Send this node's pending result, or stash it until registration.
    async fn peer_communicate(self: &Arc<Self>, run_id: &str, iteration: u64) -> PipelineResult<()> {
        let Some(payload) = self.store.get_and_remove(run_id, self.participant_id()) else {
            return Err(PipelineError::Protocol(format!(
                "No result to send for iteration {iteration}"
            )));
        };

        let staged = match &payload {
            StoreValue::Output(_) => {
                let directories = self.run_directories(run_id)?;
                stage_transfer(&directories.transfer, &directories.system).await?
            }
            StoreValue::Error(_) => Vec::new(),
        };

        {
            let mut runs = self.active_runs.lock();
            let run = runs.get_mut(run_id).ok_or_else(|| Self::unknown_run(run_id))?;
            if !run.registered {
                debug!(%run_id, iteration, "Not registered yet, stashing output");
                run.stashed_output = Some(StashedOutput {
                    payload,
                    iteration,
                    staged,
                });
                return Ok(());
            }
        }

        self.peer_send(run_id, payload, staged, iteration).await
    }

    async fn peer_send(
        self: &Arc<Self>,
        run_id: &str,
        payload: StoreValue,
        staged: Vec<String>,
        iteration: u64,
    ) -> PipelineResult<()> {
        match payload {
            StoreValue::Error(error) => self.peer_send_error(run_id, error, iteration).await,
            StoreValue::Output(output) => self.peer_send_output(run_id, output, staged, iteration).await,
        }
    }

    async fn peer_send_error(&self, run_id: &str, error: RunError, iteration: u64) -> PipelineResult<()> {
        let step = self.current_step(run_id)?;
        if let Some(run) = self.active_runs.lock().get_mut(run_id) {
            run.error = Some(error.clone());
        }
        let message = PeerRunMessage {
            id: self.participant_id().to_string(),
            run_id: run_id.to_string(),
            output: None,
            error: Some(error),
            files: None,
            step,
            iteration: Some(iteration),
            debug: DebugTimes::sent_at(now_millis()),
        };
        publish_json(self.bus.as_ref(), topics::RUN, &message, Qos::AtLeastOnce).await?;
        Ok(())
    }

    async fn peer_send_output(
        self: &Arc<Self>,
        run_id: &str,
        output: Value,
        staged: Vec<String>,
        iteration: u64,
    ) -> PipelineResult<()> {
        let me = self.participant_id().to_string();
        let step = self.current_step(run_id)?;
        let mut message = PeerRunMessage {
            id: me.clone(),
            run_id: run_id.to_string(),
            output: Some(output),
            error: None,
            files: None,
            step,
            iteration: Some(iteration),
            debug: DebugTimes::default(),
        };

        if staged.is_empty() {
            message.debug = DebugTimes::sent_at(now_millis());
            publish_json(self.bus.as_ref(), topics::RUN, &message, Qos::AtLeastOnce).await?;
            return Ok(());
        }

        let system = self.run_directories(run_id)?.system;
        let parts = create_archive(ArchiveOptions {
            source: system.clone(),
            entries: staged,
            destination: system.clone(),
            name: format!("{run_id}-{me}-tempOutput.tar.gz"),
            chunk_size: self.config.transfer.chunk_size,
            compression_level: self.config.transfer.compression_level,
        })
        .await?;

        message.files = Some(parts.clone());
        message.debug = DebugTimes::sent_at(now_millis());
        publish_json(self.bus.as_ref(), topics::RUN, &message, Qos::AtLeastOnce).await?;
        debug!(%run_id, step, iteration, parts = parts.len(), "Sent output, uploading parts");

        let inner = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = inner.upload_parts(&run_id, &system, &parts).await {
                warn!(%run_id, "Upload failed: {error}");
                let message = PeerRunMessage {
                    id: inner.participant_id().to_string(),
                    run_id: run_id.clone(),
                    output: None,
                    error: Some(error.to_run_error()),
                    files: None,
                    step,
                    iteration: Some(iteration),
                    debug: DebugTimes::sent_at(now_millis()),
                };
                if let Err(e) =
                    publish_json(inner.bus.as_ref(), topics::RUN, &message, Qos::AtLeastOnce).await
                {
                    warn!(%run_id, "Failed to report upload failure: {e}");
                }
            }
        });
        Ok(())
    }

    async fn upload_parts(&self, run_id: &str, dir: &Path, parts: &[String]) -> PipelineResult<()> {
        let transfer = self.transfer.as_ref().ok_or_else(|| {
            PipelineError::NetworkTransfer("No file server configured".to_string())
        })?;
        transfer
            .upload(self.participant_id(), run_id, dir, parts)
            .await
    }

    /// Handle a `{id}-register` acknowledgement.
    pub(crate) fn on_register_ack(self: &Arc<Self>, ack: RegisterAck) {
        let run_id = ack.run_id;
        let stashed = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(&run_id) else {
                return;
            };
            if run.registered {
                return;
            }
            run.registered = true;
            run.stashed_output.take()
        };
        info!(%run_id, "Registered with the central node");

        let Some(stashed) = stashed else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            debug!(%run_id, iteration = stashed.iteration, "Replaying stashed output");
            let sent = inner
                .peer_send(&run_id, stashed.payload, stashed.staged, stashed.iteration)
                .await;
            if let Err(error) = sent {
                inner.resolve_remote(&run_id, Err(error));
            }
        });
    }

    /// Handle a `{id}-run` message from the central node.
    pub(crate) async fn on_central_run(&self, message: CentralRunMessage, received: i64) {
        let run_id = message.run_id.clone();

        if let Some(error) = message.error {
            if let Some(run) = self.active_runs.lock().get_mut(&run_id) {
                warn!(%run_id, "Received error from the central node: {}", error.message);
                run.state_status = Some("Received error".to_string());
                run.error = Some(error.clone());
                run.remote.resolve(Err(PipelineError::Remote(error)));
            }
            return;
        }

        let directories = {
            let mut runs = self.active_runs.lock();
            let Some(run) = runs.get_mut(&run_id) else {
                return;
            };
            let round = (run.pipeline.current_step(), run.pipeline.current_iteration());
            if (message.step, message.iteration) != (round.0, Some(round.1)) || run.released == Some(round) {
                debug!(
                    %run_id,
                    step = message.step,
                    iteration = ?message.iteration,
                    current = round.1,
                    "Ignoring stale or duplicate central message"
                );
                return;
            }
            run.released = Some(round);
            run.state_status = Some("received central node data".to_string());
            run.directories.clone()
        };

        if let Some(sent) = message.debug.sent {
            debug!(
                target: "dcp::profile",
                %run_id,
                "Transmission from the central node took {}ms",
                received - sent
            );
        }

        let fetched = match message.files.as_deref() {
            Some(files) if !files.is_empty() => {
                let destination = if message.success {
                    &directories.output
                } else {
                    &directories.base
                };
                self.fetch_files(&run_id, files, destination).await
            }
            _ => Ok(()),
        };

        if let Err(error) = fetched {
            warn!(%run_id, "Failed to fetch central files: {error}");
            if !message.success {
                let run_error = error.to_run_error();
                if let Some(run) = self.active_runs.lock().get_mut(&run_id) {
                    run.error = Some(run_error.clone());
                }
                let report = PeerRunMessage {
                    id: self.participant_id().to_string(),
                    run_id: run_id.clone(),
                    output: None,
                    error: Some(run_error),
                    files: None,
                    step: message.step,
                    iteration: message.iteration,
                    debug: DebugTimes::sent_at(now_millis()),
                };
                if let Err(e) =
                    publish_json(self.bus.as_ref(), topics::RUN, &report, Qos::AtLeastOnce).await
                {
                    warn!(%run_id, "Failed to report fetch failure: {e}");
                }
            }
            self.resolve_remote(&run_id, Err(error));
            return;
        }

        if message.success && message.files.is_some() {
            let finished = FinishedMessage {
                id: self.participant_id().to_string(),
                run_id: run_id.clone(),
            };
            if let Err(e) =
                publish_json(self.bus.as_ref(), topics::FINISHED, &finished, Qos::AtLeastOnce).await
            {
                warn!(%run_id, "Failed to acknowledge final files: {e}");
            }
        }

        self.store.put(
            &run_id,
            self.participant_id(),
            StoreValue::Output(message.output.unwrap_or(Value::Null)),
        );
        if let Err(e) = clear_directory(&directories.system).await {
            warn!(%run_id, "Failed to clear system directory: {e}");
        }

        debug!(%run_id, success = message.success, "Received central node data");
        self.resolve_remote(
            &run_id,
            Ok(RemoteReply {
                success: message.success,
                received: Some(received),
            }),
        );
    }

    async fn fetch_files(&self, run_id: &str, files: &[String], destination: &Path) -> PipelineResult<()> {
        let transfer = self.transfer.as_ref().ok_or_else(|| {
            PipelineError::NetworkTransfer("No file server configured".to_string())
        })?;
        transfer
            .download(self.participant_id(), run_id, destination, files)
            .await?;
        extract_parts(destination, files, destination).await
    }
}
