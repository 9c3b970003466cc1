//! HTTP file side-channel client.
//!
//! Parts are pushed with a multipart `POST` and pulled with a `GET`. Only
//! transient network failures are retried, with a delay that grows
//! linearly with the attempt count.

use crate::error::{PipelineError, PipelineResult};
use dcp_protocol::config_models::{FileServerConfig, TransferConfig};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use std::error::Error as StdError;
use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SERVICE_DOWN: &str = "Service down, file retry limit reached";

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Worth retrying.
    Transient(String),
    /// Give up immediately.
    Fatal(String),
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::WouldBlock
    )
}

/// Whether `error` is a connection-level failure worth retrying.
pub fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_connect() {
        return true;
    }
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if is_transient_io(io.kind()) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn classify(error: reqwest::Error) -> AttemptError {
    if is_transient(&error) {
        AttemptError::Transient(error.to_string())
    } else {
        AttemptError::Fatal(error.to_string())
    }
}

/// Run `attempt` until it succeeds, fails fatally or `limit` retries are used.
///
/// The delay before retry `n` is `base_delay × n`.
///
/// # Errors
///
/// Returns `PipelineError::NetworkTransfer` with the fatal error, or
/// `Service down, file retry limit reached` once the limit is exceeded.
pub async fn with_retry<T, F, Fut>(limit: u32, base_delay: Duration, mut attempt: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut retry_count: u32 = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(reason)) => return Err(PipelineError::NetworkTransfer(reason)),
            Err(AttemptError::Transient(reason)) => {
                if retry_count >= limit {
                    warn!("Giving up after {retry_count} retries: {reason}");
                    return Err(PipelineError::NetworkTransfer(SERVICE_DOWN.to_string()));
                }
                retry_count += 1;
                debug!(retry_count, "Transient transfer failure: {reason}");
                tokio::time::sleep(base_delay * retry_count).await;
            }
        }
    }
}

/// Client of a node's file server.
#[derive(Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    url: String,
    base_delay: Duration,
    post_retry_limit: u32,
    get_retry_limit: u32,
}

impl TransferClient {
    pub fn new(server: &FileServerConfig, transfer: &TransferConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: server.url(),
            base_delay: Duration::from_millis(transfer.retry_base_delay_ms),
            post_retry_limit: transfer.post_retry_limit,
            get_retry_limit: transfer.get_retry_limit,
        }
    }

    /// Push `parts` from `dir` to the file server.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NetworkTransfer` if any part cannot be sent.
    pub async fn upload(
        &self,
        client_id: &str,
        run_id: &str,
        dir: &Path,
        parts: &[String],
    ) -> PipelineResult<()> {
        for part in parts {
            let path = dir.join(part);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| PipelineError::io(&path, e))?;

            with_retry(self.post_retry_limit, self.base_delay, || {
                let form = Form::new()
                    .text("clientId", client_id.to_string())
                    .text("runId", run_id.to_string())
                    .text("filename", part.clone())
                    .part("file", Part::bytes(bytes.clone()).file_name(part.clone()));
                async move {
                    let response = self
                        .http
                        .post(&self.url)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(classify)?;
                    if !response.status().is_success() {
                        return Err(AttemptError::Fatal(format!(
                            "Upload of {part} failed with status {}",
                            response.status()
                        )));
                    }
                    Ok(())
                }
            })
            .await?;
            debug!(%run_id, %part, "Uploaded part");
        }
        Ok(())
    }

    /// Pull `parts` of run `run_id` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NetworkTransfer` if any part cannot be fetched.
    pub async fn download(
        &self,
        client_id: &str,
        run_id: &str,
        dir: &Path,
        parts: &[String],
    ) -> PipelineResult<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::io(dir, e))?;

        for part in parts {
            let path = dir.join(part);
            with_retry(self.get_retry_limit, self.base_delay, || {
                let path = path.clone();
                async move {
                    let response = self
                        .http
                        .get(&self.url)
                        .query(&[("id", client_id), ("runId", run_id), ("file", part.as_str())])
                        .send()
                        .await
                        .map_err(classify)?;
                    if !response.status().is_success() {
                        return Err(AttemptError::Fatal(format!(
                            "Download of {part} failed with status {}",
                            response.status()
                        )));
                    }

                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .map_err(|e| AttemptError::Fatal(format!("{}: {e}", path.display())))?;
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk.map_err(classify)?;
                        file.write_all(&chunk)
                            .await
                            .map_err(|e| AttemptError::Fatal(format!("{}: {e}", path.display())))?;
                    }
                    file.flush()
                        .await
                        .map_err(|e| AttemptError::Fatal(format!("{}: {e}", path.display())))?;
                    Ok(())
                }
            })
            .await?;
            debug!(%run_id, %part, "Downloaded part");
        }
        Ok(())
    }
}
