//! Write-Ahead Log (WAL) for durability.
//!
//! File layout: a 5-byte magic header (`MWAL` + format version), then a
//! sequence of frames. Each frame is
//!
//! ```text
//! [payload length: u32 LE][CRC32 of payload: u32 LE][payload]
//! ```
//!
//! where the payload is one JSON-encoded [`WalBatch`]. A batch is the
//! unit of atomicity: recovery accepts a frame only when it is complete
//! and its checksum matches, so a torn write at the tail drops the whole
//! batch and never half of it. A bad magic header is not recoverable and
//! fails the open; a bad tail frame is logged and discarded.

use crate::record::{Document, OplogEntry};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Magic + format version, written once at file creation.
const WAL_MAGIC: &[u8; 5] = b"MWAL\x01";

/// Frames longer than this are treated as corruption, not data. A batch
/// is bounded by what one sync round can carry, far below this.
const MAX_FRAME_PAYLOAD: u32 = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("WAL header is not a meshdb log (bad magic)")]
    BadHeader,
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// One atomic unit of WAL content.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WalBatch {
    pub docs: Vec<Document>,
    pub entries: Vec<OplogEntry>,
}

/// Append handle for the log. Reading happens only through [`Wal::replay`].
#[derive(Debug)]
pub struct Wal {
    file: File,
    fsync: FsyncPolicy,
    appended: u64,
}

impl Wal {
    /// Open or create the WAL at `path`. A fresh file gets the magic
    /// header before the first batch.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(WAL_MAGIC)?;
            if fsync == FsyncPolicy::Always {
                file.sync_data()?;
            }
        }
        Ok(Self {
            file,
            fsync,
            appended: 0,
        })
    }

    /// Append one batch. The whole frame is assembled in memory and
    /// handed to the kernel in a single write, so a crash mid-append
    /// leaves at most one torn frame at the tail.
    pub fn append(&mut self, batch: &WalBatch) -> Result<(), WalError> {
        let payload = serde_json::to_vec(batch)?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame)?;
        if self.fsync == FsyncPolicy::Always {
            self.file.sync_data()?;
        }
        self.appended += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Number of batches appended since open.
    pub fn batches_written(&self) -> u64 {
        self.appended
    }

    /// Replay every intact batch from `path`, in write order.
    ///
    /// A missing file is an empty log. A damaged or incomplete tail
    /// frame ends the replay with a warning; everything before it is
    /// returned. A wrong magic header is an error: the file is not ours.
    pub fn replay(path: &Path) -> Result<Vec<WalBatch>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; WAL_MAGIC.len()];
        match read_up_to(&mut reader, &mut magic)? {
            0 => return Ok(vec![]), // zero-byte file left by an interrupted create
            n if n < magic.len() => return Err(WalError::BadHeader),
            _ if &magic != WAL_MAGIC => return Err(WalError::BadHeader),
            _ => {}
        }

        let mut batches = Vec::new();
        while let Some(batch) = read_frame(&mut reader, batches.len())? {
            batches.push(batch);
        }
        Ok(batches)
    }
}

/// Read one frame. `Ok(None)` means the log ends here: clean EOF, a
/// truncated frame, or a checksum mismatch (the latter two are logged).
/// Anything CRC-valid that still fails to parse is a real error, not
/// tail damage.
fn read_frame(reader: &mut impl Read, frame_no: usize) -> Result<Option<WalBatch>, WalError> {
    let mut header = [0u8; 8];
    match read_up_to(reader, &mut header)? {
        0 => return Ok(None), // clean EOF
        n if n < header.len() => {
            tracing::warn!("WAL frame {} has a torn header; dropping tail", frame_no);
            return Ok(None);
        }
        _ => {}
    }

    let len = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
    let expected_crc = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
    if len > MAX_FRAME_PAYLOAD {
        tracing::warn!(
            "WAL frame {} claims {} bytes; treating as corruption and dropping tail",
            frame_no,
            len
        );
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_up_to(reader, &mut payload)?;
    if got < payload.len() {
        tracing::warn!(
            "WAL frame {} truncated ({} of {} payload bytes); dropping tail",
            frame_no,
            got,
            len
        );
        return Ok(None);
    }

    if crc32fast::hash(&payload) != expected_crc {
        tracing::warn!("WAL frame {} failed its checksum; dropping tail", frame_no);
        return Ok(None);
    }

    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Fill `buf` as far as the reader allows. Unlike `read_exact`, EOF is
/// not an error: the number of bytes actually read is returned so the
/// caller can tell a clean boundary from a torn one.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, WalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
    Ok(filled)
}
