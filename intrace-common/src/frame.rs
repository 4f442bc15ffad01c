//! Length-prefixed frame codec.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON encoded
//! [`Message`]. The same codec carries control traffic and streamed trace
//! lines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest frame body accepted in either direction (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One message on the control or trace socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    /// Command (observer → agent) or single-line reply (agent → observer)
    Text(String),
    /// Reply to `help`
    Commands(Vec<String>),
    /// Full settings snapshot, pushed to every client
    Settings(BTreeMap<String, String>),
    /// Instrumentation pass progress, pushed to every client
    Progress { processed: usize, total: usize, done: bool },
    /// Instrumented/total unit counts after a pass
    Status { instrumented: usize, total: usize },
    /// One trace or system line on the streaming channel
    Trace(String),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Serialize a message into a complete frame (length prefix included)
///
/// # Errors
/// Returns an error if serialization fails or the body exceeds [`MAX_FRAME_LEN`]
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
    let len = body.len() as u32;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame and flush
///
/// # Errors
/// Returns an error if encoding or the underlying write fails
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete.
///
/// A clean end-of-stream before the length prefix yields [`FrameError::Closed`].
///
/// # Errors
/// Returns an error on transport failure, oversize frames or malformed JSON
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message, FrameError> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
