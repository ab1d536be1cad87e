//! Snapshot File Server
//!
//! Serves snapshot directories to cloning nodes. Every request carries the
//! cluster token; only paths under a snapshot root are served.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use super::{
    is_plain_file_name, write_batch_entry_header, BatchFileEntry, BATCH_DOWNLOAD_PATH,
    DOWNLOAD_PATH,
};
use crate::error::{Error, Result};
use crate::storage::fs;

/// Pipe buffer between a batch payload writer and its response body
const BATCH_STREAM_BUFFER: usize = 256 * 1024;

/// Shared handler state
#[derive(Clone)]
struct FileServerState {
    token: Arc<String>,
    roots: Arc<Vec<PathBuf>>,
}

impl FileServerState {
    fn check_token(&self, token: Option<&str>) -> std::result::Result<(), Response> {
        if token == Some(self.token.as_str()) {
            Ok(())
        } else {
            Err((StatusCode::UNAUTHORIZED, "invalid token").into_response())
        }
    }

    /// Canonical path of `requested`, which must sit under a snapshot root
    fn resolve(&self, requested: &str) -> std::result::Result<PathBuf, Response> {
        let trimmed = requested.trim_end_matches('/');
        let raw = if trimmed.is_empty() { "/" } else { trimmed };
        let canonical = std::fs::canonicalize(raw)
            .map_err(|e| error_response(&Error::from_io(Path::new(raw), e)))?;
        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(canonical)
        } else {
            Err((StatusCode::FORBIDDEN, "path outside snapshot roots").into_response())
        }
    }
}

fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

/// HTTP server for snapshot files
pub struct FileServer {
    listener: TcpListener,
    state: FileServerState,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl FileServer {
    /// Bind the listening socket; `snapshot_roots` bound what may be served
    pub async fn bind(bind_address: &str, token: String, snapshot_roots: Vec<PathBuf>) -> Result<Self> {
        let roots = snapshot_roots
            .into_iter()
            .map(|root| std::fs::canonicalize(&root).unwrap_or(root))
            .collect();
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Ok(Self {
            listener,
            state: FileServerState {
                token: Arc::new(token),
                roots: Arc::new(roots),
            },
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops [`Self::serve`]
    pub fn shutdown_handle(&self) -> tokio::sync::watch::Sender<bool> {
        self.shutdown.clone()
    }

    fn create_router(state: FileServerState) -> Router {
        Router::new()
            .route(DOWNLOAD_PATH, get(handle_download))
            .route(
                BATCH_DOWNLOAD_PATH,
                get(handle_batch_get).post(handle_batch_download),
            )
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until shut down
    pub async fn serve(self) -> Result<()> {
        let app = Self::create_router(self.state.clone());
        tracing::info!("Snapshot file server listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("Snapshot file server stopped");
        Ok(())
    }
}

// ============ Handlers ============

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    token: Option<String>,
    file: Option<String>,
}

/// GET lists a directory or returns a file; HEAD returns only its length
async fn handle_download(
    State(state): State<FileServerState>,
    method: Method,
    Query(query): Query<DownloadQuery>,
) -> Response {
    if let Err(resp) = state.check_token(query.token.as_deref()) {
        return resp;
    }
    let Some(file) = query.file else {
        return (StatusCode::BAD_REQUEST, "missing file parameter").into_response();
    };
    let path = match state.resolve(&file) {
        Ok(path) => path,
        Err(resp) => return resp,
    };

    if file.ends_with('/') || path.is_dir() {
        return match tokio::task::spawn_blocking(move || fs::list_files(&path)).await {
            Ok(Ok(names)) => (StatusCode::OK, names.join("\n")).into_response(),
            Ok(Err(e)) => error_response(&e),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
    }

    let len = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => return error_response(&Error::from_io(&path, e)),
    };
    if method == Method::HEAD {
        return (StatusCode::OK, [(header::CONTENT_LENGTH, len.to_string())]).into_response();
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => return error_response(&Error::from_io(&path, e)),
    };
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file.take(len))),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    token: Option<String>,
    dir: Option<String>,
    check: Option<String>,
    list: Option<String>,
}

/// Capability check and `(name, size)` listing
async fn handle_batch_get(
    State(state): State<FileServerState>,
    Query(query): Query<BatchQuery>,
) -> Response {
    if let Err(resp) = state.check_token(query.token.as_deref()) {
        return resp;
    }
    if query.check.as_deref() == Some("true") {
        return (StatusCode::OK, "OK").into_response();
    }
    if query.list.as_deref() != Some("true") {
        return (StatusCode::BAD_REQUEST, "expected check=true or list=true").into_response();
    }
    let Some(dir) = query.dir else {
        return (StatusCode::BAD_REQUEST, "missing dir parameter").into_response();
    };
    let dir = match state.resolve(&dir) {
        Ok(dir) => dir,
        Err(resp) => return resp,
    };

    let listing = tokio::task::spawn_blocking(move || -> Result<Vec<BatchFileEntry>> {
        let mut entries = Vec::new();
        for name in fs::list_files(&dir)? {
            let size = fs::file_size(&dir.join(&name))?;
            entries.push(BatchFileEntry { name, size });
        }
        Ok(entries)
    })
    .await;

    match listing {
        Ok(Ok(entries)) => Json(entries).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Return every file named in the body, one per line, as one payload
async fn handle_batch_download(
    State(state): State<FileServerState>,
    Query(query): Query<BatchQuery>,
    body: String,
) -> Response {
    if let Err(resp) = state.check_token(query.token.as_deref()) {
        return resp;
    }
    let Some(dir) = query.dir else {
        return (StatusCode::BAD_REQUEST, "missing dir parameter").into_response();
    };
    let dir = match state.resolve(&dir) {
        Ok(dir) => dir,
        Err(resp) => return resp,
    };

    let names: Vec<String> = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bad) = names.iter().find(|n| !is_plain_file_name(n)) {
        return (StatusCode::BAD_REQUEST, format!("invalid file name {}", bad)).into_response();
    }

    // every file must exist before the first byte goes out
    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => files.push((name, path, meta.len())),
            Ok(_) => {
                return (StatusCode::BAD_REQUEST, format!("{} is not a file", name)).into_response()
            }
            Err(e) => return error_response(&Error::from_io(&path, e)),
        }
    }

    let (writer, reader) = tokio::io::duplex(BATCH_STREAM_BUFFER);
    tokio::spawn(async move {
        if let Err(e) = write_batch_payload(writer, files).await {
            tracing::warn!(error = %e, "batch download aborted");
        }
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

/// Stream each file behind its entry header. A failure closes the pipe
/// early and the client sees a short payload.
async fn write_batch_payload(
    mut writer: DuplexStream,
    files: Vec<(String, PathBuf, u64)>,
) -> Result<()> {
    for (name, path, size) in files {
        let mut header = Vec::new();
        write_batch_entry_header(&mut header, &name, size)?;
        writer.write_all(&header).await?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::from_io(&path, e))?;
        let copied = tokio::io::copy(&mut file.take(size), &mut writer).await?;
        if copied != size {
            return Err(Error::Internal(format!(
                "{} shrank to {} of {} bytes while streaming",
                path.display(),
                copied,
                size
            )));
        }
    }
    writer.shutdown().await?;
    Ok(())
}
