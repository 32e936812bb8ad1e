//! Frame format shared by both ends of a session.
//!
//! Every message is a little-endian `u32` payload length followed by a
//! bincode payload. The host sends one [`UpdateEnvelope`] per tick and the
//! remote answers each one with a [`ControlBatch`].

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use twinplay_core::controls::ControlChange;
use twinplay_core::machine::Snapshot;

use crate::error::LinkError;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Control changes the remote queued since its previous answer. `None` when
/// there were none.
pub type ControlBatch = Option<Vec<ControlChange>>;

/// Everything the remote needs to replay one host tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub power_change: Option<bool>,
    pub snapshot: Option<Snapshot>,
    pub control_changes: Option<Vec<ControlChange>>,
}

impl UpdateEnvelope {
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// True for a bare tick with nothing attached.
    pub fn is_tick_only(&self) -> bool {
        self.power_change.is_none() && self.snapshot.is_none() && self.control_changes.is_none()
    }
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), LinkError> {
    let payload = bincode::serialize(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(LinkError::Protocol(format!(
            "outgoing frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, LinkError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(LinkError::Protocol(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}
