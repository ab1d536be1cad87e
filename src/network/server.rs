//! Snapshot RPC Server
//!
//! Accepts snapshot requests from cloning nodes and runs them against the
//! local storage engine on the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{AgentResult, Message, RpcStatus, StatusCode};
use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::storage::StorageEngine;

/// Snapshot RPC server
pub struct RpcServer {
    listener: TcpListener,
    engine: Arc<StorageEngine>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl RpcServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str, engine: Arc<StorageEngine>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Ok(Self {
            listener,
            engine,
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

    /// Accept connections until shut down
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Snapshot RPC server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, engine).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Snapshot RPC server stopped");
        Ok(())
    }
}

async fn handle_connection(socket: TcpStream, engine: Arc<StorageEngine>) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        tracing::trace!("Received {}", message.type_name());

        let engine = Arc::clone(&engine);
        let response = tokio::task::spawn_blocking(move || dispatch(&engine, message))
            .await
            .unwrap_or_else(|e| {
                Message::AgentResult(AgentResult::error(RpcStatus::error(
                    StatusCode::InternalError,
                    format!("snapshot handler panicked: {}", e),
                )))
            });
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

/// Run one request against the engine
fn dispatch(engine: &StorageEngine, message: Message) -> Message {
    let result = match message {
        Message::MakeSnapshot(request) => {
            match engine.snapshot_mgr().make_snapshot(engine, &request) {
                Ok(outcome) => AgentResult {
                    status: RpcStatus::ok(),
                    snapshot_path: Some(format!("{}/", outcome.snapshot_path.display())),
                    allow_incremental_clone: Some(outcome.allow_incremental_clone),
                },
                Err(e) => {
                    tracing::warn!(tablet_id = request.tablet_id, error = %e, "make snapshot failed");
                    AgentResult::error(RpcStatus::from(&e))
                }
            }
        }
        Message::ReleaseSnapshot { snapshot_path } => {
            match engine.snapshot_mgr().release_snapshot(engine, &snapshot_path) {
                Ok(()) => AgentResult::ok(),
                Err(e) => {
                    tracing::warn!(%snapshot_path, error = %e, "release snapshot failed");
                    AgentResult::error(RpcStatus::from(&e))
                }
            }
        }
        Message::AgentResult(_) => AgentResult::error(RpcStatus::error(
            StatusCode::InvalidArgument,
            "AgentResult is not a request",
        )),
    };
    Message::AgentResult(result)
}
