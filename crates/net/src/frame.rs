//! Wire framing.
//!
//! Every logical message travels as:
//!
//! ```text
//! [length: u32 little-endian]   // payload bytes only
//! [type:   u8]
//! [flags:  u8]                  // bit 0 = payload is Brotli-compressed
//! [payload: length bytes]
//! ```

use crate::message::MessageType;
use crate::NetError;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Flag bit 0: payload is Brotli-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Upper bound on a single payload. Anything larger is a protocol
/// violation, not a legitimate change set.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// A raw frame as read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: MessageType,
    flags: u8,
    payload: &[u8],
) -> Result<(), NetError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(NetError::Protocol(format!(
            "payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&[msg_type as u8, flags]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Fails on length overflow or an unknown type tag.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, NetError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(NetError::Protocol(format!(
            "frame length {} exceeds limit",
            len
        )));
    }

    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let msg_type = MessageType::from_u8(header[0])?;
    let flags = header[1];

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        msg_type,
        flags,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2);
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
        // Writing to a Vec cannot fail.
        writer.write_all(data).expect("brotli write to vec");
        writer.flush().expect("brotli flush to vec");
    }
    out
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, NetError> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, BROTLI_BUFFER)
        .read_to_end(&mut out)
        .map_err(|e| NetError::Protocol(format!("brotli decompress failed: {}", e)))?;
    Ok(out)
}

/// Apply the negotiated compression policy to an encoded payload:
/// compress when enabled and the payload exceeds `threshold`.
pub fn maybe_compress(payload: Vec<u8>, enabled: bool, threshold: usize) -> (u8, Vec<u8>) {
    if enabled && payload.len() > threshold {
        (FLAG_COMPRESSED, compress(&payload))
    } else {
        (0, payload)
    }
}

/// Undo compression according to the frame flags.
pub fn maybe_decompress(flags: u8, payload: Vec<u8>) -> Result<Vec<u8>, NetError> {
    if flags & FLAG_COMPRESSED != 0 {
        decompress(&payload)
    } else {
        Ok(payload)
    }
}
