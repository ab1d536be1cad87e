//! HTTP Module
//!
//! Snapshot file transfer over HTTP: the axum file server on the source
//! side and the blocking client used by clone tasks.
//!
//! Batched downloads answer with one payload holding every requested file:
//! `[u32 LE name_len][name][u64 LE size][bytes]` per file, in request order.

mod client;
mod server;

pub use client::{HttpClient, SnapshotFileEndpoint};
pub use server::FileServer;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Single-file listing and download endpoint
pub const DOWNLOAD_PATH: &str = "/api/_tablet/_download";
/// Batched listing, download and capability check endpoint
pub const BATCH_DOWNLOAD_PATH: &str = "/api/_tablet/_batch_download";

/// Longest file name accepted in a batch payload
const MAX_NAME_LEN: u32 = 4096;

/// One entry of a batched listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFileEntry {
    pub name: String,
    pub size: u64,
}

/// Write the header of one batch payload entry
pub fn write_batch_entry_header<W: Write>(writer: &mut W, name: &str, size: u64) -> Result<()> {
    writer.write_u32::<LittleEndian>(name.len() as u32)?;
    writer.write_all(name.as_bytes())?;
    writer.write_u64::<LittleEndian>(size)?;
    Ok(())
}

/// Read the header of one batch payload entry; `None` at a clean end
pub fn read_batch_entry_header<R: Read>(reader: &mut R) -> Result<Option<(String, u64)>> {
    let name_len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if name_len > MAX_NAME_LEN {
        return Err(Error::Network(format!(
            "batch entry name of {} bytes exceeds limit",
            name_len
        )));
    }
    let mut name = vec![0u8; name_len as usize];
    reader.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| Error::Network("batch entry name is not utf-8".into()))?;
    let size = reader.read_u64::<LittleEndian>()?;
    Ok(Some((name, size)))
}

/// Whether `name` is a bare file name
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}
