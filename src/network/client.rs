//! Snapshot RPC Client
//!
//! Blocking client used by clone tasks to ask a source node for a snapshot
//! and to release it afterwards. One connection per call.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::protocol::{AgentResult, Message, SnapshotRequest};
use super::{read_message_blocking, write_message_blocking};
use crate::error::{Error, Result};

/// Snapshot made on a remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot {
    /// Snapshot directory, always ending with `/`
    pub snapshot_path: String,
    /// The snapshot only holds the requested missing versions
    pub allow_incremental: bool,
}

/// Snapshot operations against a remote node
pub trait SnapshotService: Send + Sync {
    fn make_snapshot(&self, host: &str, port: u16, request: &SnapshotRequest)
        -> Result<RemoteSnapshot>;

    fn release_snapshot(&self, host: &str, port: u16, snapshot_path: &str) -> Result<()>;
}

/// TCP snapshot client
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl SnapshotClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        let address = format!("{}:{}", host, port);
        address
            .to_socket_addrs()
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| Error::ConnectionFailed {
                address,
                reason: "no address resolved".into(),
            })
    }

    /// Send one request and wait for its result
    fn call(&self, host: &str, port: u16, message: &Message) -> Result<AgentResult> {
        let addr = Self::resolve(host, port)?;
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Error::ConnectionTimeout(addr.to_string())
            } else {
                Error::ConnectionFailed {
                    address: addr.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.request_timeout))?;
        stream.set_write_timeout(Some(self.request_timeout))?;

        tracing::trace!("Sending {} to {}", message.type_name(), addr);
        write_message_blocking(&mut stream, message)?;
        let response = read_message_blocking(&mut stream).map_err(|e| match e {
            Error::Io(io)
                if io.kind() == std::io::ErrorKind::WouldBlock
                    || io.kind() == std::io::ErrorKind::TimedOut =>
            {
                Error::ConnectionTimeout(addr.to_string())
            }
            other => other,
        })?;

        match response {
            Message::AgentResult(result) => Ok(result),
            other => Err(Error::Network(format!(
                "unexpected {} in reply to {}",
                other.type_name(),
                message.type_name()
            ))),
        }
    }
}

impl SnapshotService for SnapshotClient {
    fn make_snapshot(
        &self,
        host: &str,
        port: u16,
        request: &SnapshotRequest,
    ) -> Result<RemoteSnapshot> {
        let result = self.call(host, port, &Message::MakeSnapshot(request.clone()))?;
        if !result.status.is_ok() {
            return Err(Error::RemoteStatus {
                code: result.status.code.to_string(),
                message: result.status.message(),
            });
        }

        let mut snapshot_path = result.snapshot_path.ok_or_else(|| {
            Error::Internal("success snapshot request without snapshot path".into())
        })?;
        if !snapshot_path.ends_with('/') {
            snapshot_path.push('/');
        }
        Ok(RemoteSnapshot {
            snapshot_path,
            allow_incremental: result.allow_incremental_clone.unwrap_or(false),
        })
    }

    fn release_snapshot(&self, host: &str, port: u16, snapshot_path: &str) -> Result<()> {
        let message = Message::ReleaseSnapshot {
            snapshot_path: snapshot_path.to_string(),
        };
        let result = self.call(host, port, &message)?;
        if !result.status.is_ok() {
            return Err(Error::RemoteStatus {
                code: result.status.code.to_string(),
                message: result.status.message(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{RpcStatus, StatusCode};
    use std::net::TcpListener;

    /// Serve one connection with a canned reply
    fn one_shot_server(reply: AgentResult) -> (u16, std::thread::JoinHandle<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_message_blocking(&mut stream).unwrap();
            write_message_blocking(&mut stream, &Message::AgentResult(reply)).unwrap();
            request
        });
        (port, handle)
    }

    fn client() -> SnapshotClient {
        SnapshotClient::new(Duration::from_secs(2), Duration::from_secs(5))
    }

    #[test]
    fn test_make_snapshot_normalizes_path() {
        let mut reply = AgentResult::ok();
        reply.snapshot_path = Some("/data/snapshot/x".into());
        let (port, handle) = one_shot_server(reply);

        let request = SnapshotRequest::for_clone(1, 2, 10, &[], 0);
        let snapshot = client().make_snapshot("127.0.0.1", port, &request).unwrap();
        assert_eq!(snapshot.snapshot_path, "/data/snapshot/x/");
        assert!(!snapshot.allow_incremental);
        assert_eq!(handle.join().unwrap(), Message::MakeSnapshot(request));
    }

    #[test]
    fn test_make_snapshot_without_path_is_internal() {
        let (port, handle) = one_shot_server(AgentResult::ok());
        let request = SnapshotRequest::for_clone(1, 2, 10, &[], 0);
        let err = client().make_snapshot("127.0.0.1", port, &request).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        handle.join().unwrap();
    }

    #[test]
    fn test_remote_status_is_surfaced() {
        let reply = AgentResult::error(RpcStatus::error(StatusCode::NotFound, "tablet 1 not found"));
        let (port, handle) = one_shot_server(reply);
        let err = client().release_snapshot("127.0.0.1", port, "/x/").unwrap_err();
        match err {
            Error::RemoteStatus { code, message } => {
                assert_eq!(code, "NOT_FOUND");
                assert!(message.contains("tablet 1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = client().release_snapshot("127.0.0.1", port, "/x/").unwrap_err();
        assert!(err.is_retryable());
    }
}
