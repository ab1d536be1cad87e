//! Network Module
//!
//! Snapshot RPCs over TCP. Every message travels as one frame:
//! `[u32 length LE][u32 crc32 LE][bincode body]`.

mod client;
mod protocol;
mod server;

pub use client::{RemoteSnapshot, SnapshotClient, SnapshotService};
pub use protocol::{AgentResult, FrameHeader, Message, RpcStatus, SnapshotRequest, StatusCode};
pub use server::RpcServer;

use crate::error::{Error, Result};

fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Message> {
    let computed_checksum = crc32fast::hash(body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }
    Ok(Message::deserialize(body)?)
}

fn check_length(header: &FrameHeader) -> Result<()> {
    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Network(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }
    Ok(())
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    check_length(&header)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    decode_body(&header, &body)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Blocking counterpart of [`read_message`]
pub fn read_message_blocking<R: std::io::Read>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes);
    check_length(&header)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body)?;
    decode_body(&header, &body)
}

/// Blocking counterpart of [`write_message`]
pub fn write_message_blocking<W: std::io::Write>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_frame_roundtrip() {
        let message = Message::ReleaseSnapshot {
            snapshot_path: "/data/snapshot/20240101000000.0.60/".into(),
        };
        let mut buf = Vec::new();
        write_message_blocking(&mut buf, &message).unwrap();
        let restored = read_message_blocking(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let message = Message::AgentResult(AgentResult::ok());
        let mut buf = Vec::new();
        write_message_blocking(&mut buf, &message).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            read_message_blocking(&mut buf.as_slice()),
            Err(Error::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_async_reads_blocking_frame() {
        let message = Message::AgentResult(AgentResult::ok());
        let mut buf = Vec::new();
        write_message_blocking(&mut buf, &message).unwrap();
        let restored = read_message(&mut buf.as_slice()).await.unwrap();
        assert_eq!(restored, message);
    }
}
