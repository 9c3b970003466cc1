//! HTTP file side-channel server run by the central node.
//!
//! - `POST /transfer` takes a multipart body `{clientId, runId, filename, file}`.
//! - `GET /transfer?id=&runId=&file=` returns a part of the central node's
//!   own output, or 404.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Decides where parts live. Implemented by the central node.
#[async_trait]
pub trait TransferHandler: Send + Sync + 'static {
    /// Directory an upload from `client_id` for `run_id` is stored in, or
    /// `None` if the run or client is unknown.
    fn upload_directory(&self, client_id: &str, run_id: &str) -> Option<PathBuf>;

    /// Called once an uploaded part is fully on disk.
    async fn part_received(&self, client_id: &str, run_id: &str, filename: &str);

    /// Directory the parts of `run_id` are served from.
    fn download_directory(&self, run_id: &str) -> Option<PathBuf>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadQuery {
    #[serde(default)]
    id: Option<String>,
    run_id: String,
    file: String,
}

/// Whether `name` is a plain file name.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// Build the `/transfer` routes. Bodies up to `body_limit` bytes are accepted.
pub fn router(handler: Arc<dyn TransferHandler>, path: &str, body_limit: usize) -> Router {
    Router::new()
        .route(path, post(upload).get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(handler)
}

/// Serve `router` on `listener` in the background.
pub fn serve(listener: TcpListener, router: Router) -> (SocketAddr, JoinHandle<()>) {
    let addr = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("File server error: {e}");
        }
    });
    (addr, task)
}

async fn upload(
    State(handler): State<Arc<dyn TransferHandler>>,
    mut multipart: Multipart,
) -> Response {
    let mut client_id = None;
    let mut run_id = None;
    let mut filename = None;
    let mut file = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        let outcome = match name.as_str() {
            "clientId" => field.text().await.map(|v| client_id = Some(v)),
            "runId" => field.text().await.map(|v| run_id = Some(v)),
            "filename" => field.text().await.map(|v| filename = Some(v)),
            "file" => field.bytes().await.map(|v| file = Some(v)),
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    }

    let (Some(client_id), Some(run_id), Some(filename), Some(file)) =
        (client_id, run_id, filename, file)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "clientId, runId, filename and file are required",
        );
    };
    if !is_safe_name(&filename) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid filename");
    }

    let Some(dir) = handler.upload_directory(&client_id, &run_id) else {
        warn!(%run_id, %client_id, "Upload for unknown pipeline run");
        return error_response(StatusCode::NOT_FOUND, "Remote has no such pipeline run");
    };

    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let path = dir.join(&filename);
    if let Err(e) = tokio::fs::write(&path, &file).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    debug!(%run_id, %client_id, %filename, bytes = file.len(), "Received part");

    handler.part_received(&client_id, &run_id, &filename).await;
    StatusCode::OK.into_response()
}

async fn download(
    State(handler): State<Arc<dyn TransferHandler>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    if !is_safe_name(&query.file) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid filename");
    }
    let Some(dir) = handler.download_directory(&query.run_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(dir.join(&query.file)).await {
        Ok(bytes) => {
            debug!(
                run_id = %query.run_id,
                client_id = query.id.as_deref().unwrap_or("unknown"),
                file = %query.file,
                "Serving part"
            );
            Response::new(Body::from(bytes))
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transfer::TransferClient;
    use dcp_protocol::config_models::{FileServerConfig, TransferConfig};
    use parking_lot::Mutex;
    use std::path::Path;

    struct DirectoryHandler {
        root: PathBuf,
        received: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl TransferHandler for DirectoryHandler {
        fn upload_directory(&self, client_id: &str, run_id: &str) -> Option<PathBuf> {
            (run_id == "run-1").then(|| self.root.join("uploads").join(client_id))
        }

        async fn part_received(&self, client_id: &str, run_id: &str, filename: &str) {
            self.received
                .lock()
                .push((client_id.to_string(), run_id.to_string(), filename.to_string()));
        }

        fn download_directory(&self, run_id: &str) -> Option<PathBuf> {
            (run_id == "run-1").then(|| self.root.join("outgoing"))
        }
    }

    async fn start_server(root: &Path) -> (Arc<DirectoryHandler>, TransferClient) {
        let handler = Arc::new(DirectoryHandler {
            root: root.to_path_buf(),
            received: Mutex::new(Vec::new()),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (addr, _task) = serve(listener, router(handler.clone(), "/transfer", 1024 * 1024));

        let server = FileServerConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            ..FileServerConfig::default()
        };
        let transfer = TransferConfig {
            retry_base_delay_ms: 1,
            post_retry_limit: 2,
            get_retry_limit: 2,
            ..TransferConfig::default()
        };
        (handler, TransferClient::new(&server, &transfer))
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (handler, client) = start_server(temp_dir.path()).await;

        let local = temp_dir.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("a.tar.gz.0"), b"part zero").unwrap();

        client
            .upload("site-a", "run-1", &local, &["a.tar.gz.0".to_string()])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(temp_dir.path().join("uploads/site-a/a.tar.gz.0")).unwrap(),
            b"part zero"
        );
        assert_eq!(
            handler.received.lock().as_slice(),
            [("site-a".to_string(), "run-1".to_string(), "a.tar.gz.0".to_string())]
        );

        let outgoing = temp_dir.path().join("outgoing");
        std::fs::create_dir_all(&outgoing).unwrap();
        std::fs::write(outgoing.join("b.tar.gz.0"), b"central part").unwrap();

        let fetched = temp_dir.path().join("fetched");
        client
            .download("site-a", "run-1", &fetched, &["b.tar.gz.0".to_string()])
            .await
            .unwrap();
        assert_eq!(std::fs::read(fetched.join("b.tar.gz.0")).unwrap(), b"central part");
    }

    #[tokio::test]
    async fn test_missing_part_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (_handler, client) = start_server(temp_dir.path()).await;

        let error = client
            .download("site-a", "run-1", temp_dir.path(), &["nope.0".to_string()])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_upload_for_unknown_run_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (handler, client) = start_server(temp_dir.path()).await;
        std::fs::write(temp_dir.path().join("x.0"), b"x").unwrap();

        let error = client
            .upload("site-a", "run-9", temp_dir.path(), &["x.0".to_string()])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("404"));
        assert!(handler.received.lock().is_empty());
    }

    #[test]
    fn test_unsafe_names() {
        assert!(is_safe_name("run-1-site-a-tempOutput.tar.gz.0"));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name(".."));
        assert!(!is_safe_name(""));
    }
}
