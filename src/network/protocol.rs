//! Snapshot RPC Protocol
//!
//! Messages exchanged between a cloning node and the node holding the
//! source replica.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Status codes carried by RPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    NotFound,
    TryLockFailed,
    ExceededLimit,
    InternalError,
    RuntimeError,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Cancelled => write!(f, "CANCELLED"),
            StatusCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            StatusCode::NotFound => write!(f, "NOT_FOUND"),
            StatusCode::TryLockFailed => write!(f, "TRY_LOCK_FAILED"),
            StatusCode::ExceededLimit => write!(f, "EXCEEDED_LIMIT"),
            StatusCode::InternalError => write!(f, "INTERNAL_ERROR"),
            StatusCode::RuntimeError => write!(f, "RUNTIME_ERROR"),
        }
    }
}

/// Status of a remote operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub error_msgs: Vec<String>,
}

impl RpcStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_msgs: vec![message.into()],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn message(&self) -> String {
        self.error_msgs.join("; ")
    }
}

impl From<&crate::Error> for RpcStatus {
    fn from(e: &crate::Error) -> Self {
        use crate::Error;
        let code = match e {
            Error::NotFound(_) | Error::TabletNotFound(_) => StatusCode::NotFound,
            Error::InvalidArgument(_) | Error::PermissionDenied(_) => StatusCode::InvalidArgument,
            Error::TryLockFailed(_) | Error::TransitionConflict { .. } => {
                StatusCode::TryLockFailed
            }
            Error::ExceededLimit { .. } => StatusCode::ExceededLimit,
            Error::Internal(_) => StatusCode::InternalError,
            _ => StatusCode::RuntimeError,
        };
        RpcStatus::error(code, e.to_string())
    }
}

/// Request to make a snapshot of one tablet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub tablet_id: i64,
    pub schema_hash: i32,
    /// Version the snapshot must reach
    pub version: Option<i64>,
    /// Versions the requester lacks; non-empty asks for an incremental snapshot
    pub missing_version: Vec<i64>,
    /// Seconds the snapshot may live before the source sweeps it
    pub timeout: Option<u64>,
    pub is_copy_binlog: Option<bool>,
}

impl SnapshotRequest {
    pub fn new(tablet_id: i64, schema_hash: i32) -> Self {
        Self {
            tablet_id,
            schema_hash,
            version: None,
            missing_version: Vec::new(),
            timeout: None,
            is_copy_binlog: None,
        }
    }

    /// Request sent by a cloning node: asks for `missing_versions` up to
    /// `version`, always with binlog. A zero timeout leaves the expiry to
    /// the source.
    pub fn for_clone(
        tablet_id: i64,
        schema_hash: i32,
        version: i64,
        missing_versions: &[Version],
        timeout_s: u64,
    ) -> Self {
        Self {
            tablet_id,
            schema_hash,
            version: Some(version),
            missing_version: missing_versions.iter().map(|v| v.start).collect(),
            timeout: (timeout_s > 0).then_some(timeout_s),
            is_copy_binlog: Some(true),
        }
    }
}

/// Response to a snapshot request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: RpcStatus,
    pub snapshot_path: Option<String>,
    pub allow_incremental_clone: Option<bool>,
}

impl AgentResult {
    pub fn ok() -> Self {
        Self {
            status: RpcStatus::ok(),
            snapshot_path: None,
            allow_incremental_clone: None,
        }
    }

    pub fn error(status: RpcStatus) -> Self {
        Self {
            status,
            snapshot_path: None,
            allow_incremental_clone: None,
        }
    }
}

/// Snapshot RPC message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    MakeSnapshot(SnapshotRequest),
    ReleaseSnapshot { snapshot_path: String },
    AgentResult(AgentResult),
}

impl Message {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::MakeSnapshot(_) => "MakeSnapshot",
            Message::ReleaseSnapshot { .. } => "ReleaseSnapshot",
            Message::AgentResult(_) => "AgentResult",
        }
    }
}

/// Frame header for network messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body a peer may announce
    pub const MAX_BODY: u32 = 64 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.length);
        LittleEndian::write_u32(&mut bytes[4..8], self.checksum);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: LittleEndian::read_u32(&bytes[0..4]),
            checksum: LittleEndian::read_u32(&bytes[4..8]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let mut req = SnapshotRequest::new(15001, 368169781);
        req.version = Some(10);
        req.missing_version = vec![8, 9, 10];
        req.is_copy_binlog = Some(true);
        let msg = Message::MakeSnapshot(req);

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.type_name(), "MakeSnapshot");
    }

    #[test]
    fn test_clone_request_fields() {
        let missing = vec![Version::singleton(8), Version::singleton(9)];
        let req = SnapshotRequest::for_clone(1, 2, 9, &missing, 0);
        assert_eq!(req.missing_version, vec![8, 9]);
        assert_eq!(req.version, Some(9));
        assert_eq!(req.timeout, None);
        assert_eq!(req.is_copy_binlog, Some(true));
        assert_eq!(SnapshotRequest::for_clone(1, 2, 9, &[], 30).timeout, Some(30));
    }

    #[test]
    fn test_frame_header() {
        let data = b"test data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_status_from_error() {
        let status = RpcStatus::from(&crate::Error::TabletNotFound(3));
        assert_eq!(status.code, StatusCode::NotFound);
        assert!(status.message().contains('3'));
        assert!(RpcStatus::ok().is_ok());
    }
}
