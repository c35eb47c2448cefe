//! Wire format of the cluster connection.
//!
//! Every message is one frame: a big-endian `u32` body length followed by the
//! CBOR encoding of a [`Request`] or [`Response`]. Calls are tagged with an id
//! chosen by the client, so several calls share one stream.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::Snapshot;
use crate::core::Value;
use crate::environment::EnvironmentProperties;
use crate::error::ClusterError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Frames above this size are rejected without reading them.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Hello { version: u32 },
    /// Asks how many concurrent duplicates the remote takes.
    Negotiate { call: u64, requested: usize },
    /// Runs one duplicate of an inner task.
    Run { call: u64, factory: Snapshot, index: usize },
    Cancel { call: u64 },
    Goodbye,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Welcome {
        version: u32,
        name: String,
        environment: EnvironmentProperties,
        capacity: usize,
    },
    Negotiated { call: u64, accepted: usize },
    Result { call: u64, outcome: RemoteOutcome },
    /// A failure outside of any task body. Without a call id the whole
    /// connection is unusable.
    Error { call: Option<u64>, message: String },
}

/// Outcome of one remote duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteOutcome {
    Success(Value),
    Failed(String),
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ClusterError> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body).map_err(|e| ClusterError::Protocol(e.to_string()))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(ClusterError::Protocol(format!("frame of {} bytes is too large", body.len())));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `None` when the stream ended cleanly before a new frame.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ClusterError> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Protocol(format!("frame of {len} bytes is too large")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    ciborium::from_reader(body.as_slice())
        .map(Some)
        .map_err(|e| ClusterError::Protocol(e.to_string()))
}
