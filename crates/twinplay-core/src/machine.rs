use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controls::ControlChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// Display standard of the emulated machine; selects the frame rate the
/// clock runs at.
pub enum VideoStandard {
    #[default]
    Ntsc,
    Pal,
}

impl VideoStandard {
    pub const fn fps(self) -> f64 {
        match self {
            VideoStandard::Ntsc => 60.0,
            VideoStandard::Pal => 50.0,
        }
    }
}

/// Full serialized state of an emulated machine.
///
/// The contents are private to the machine that produced them; everything
/// outside the machine only moves them around.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("snapshot could not be encoded: {0}")]
    Encode(#[source] bincode::Error),
    #[error("snapshot could not be decoded: {0}")]
    Decode(#[source] bincode::Error),
    #[error("snapshot is inconsistent: {0}")]
    InvalidSnapshot(String),
}

/// An emulated machine driven one clock pulse at a time.
///
/// Implementations must be deterministic: two machines loaded from the same
/// snapshot and fed the same control changes at the same pulses stay
/// identical.
pub trait Machine: Send {
    fn power_on(&mut self);

    fn power_off(&mut self);

    fn is_powered(&self) -> bool;

    /// Advance the emulation by one pulse (one video frame).
    fn clock_pulse(&mut self);

    fn save_state(&self) -> Result<Snapshot, MachineError>;

    /// Replace the whole machine state. A failed load leaves the machine
    /// untouched.
    fn load_state(&mut self, snapshot: &Snapshot) -> Result<(), MachineError>;

    fn control_changed(&mut self, change: &ControlChange);

    /// Corrupt working memory on demand.
    fn power_fry(&mut self);

    fn video_standard(&self) -> VideoStandard {
        VideoStandard::default()
    }
}

/// Persistent storage for save-state slots.
pub trait SaveStateMedia: Send {
    fn save_state(&mut self, slot: u8, snapshot: &Snapshot) -> bool;

    fn load_state(&mut self, slot: u8) -> Option<Snapshot>;
}

/// Save-state slots kept in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemorySaveStateMedia {
    slots: HashMap<u8, Snapshot>,
}

impl MemorySaveStateMedia {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaveStateMedia for MemorySaveStateMedia {
    fn save_state(&mut self, slot: u8, snapshot: &Snapshot) -> bool {
        self.slots.insert(slot, snapshot.clone());
        true
    }

    fn load_state(&mut self, slot: u8) -> Option<Snapshot> {
        self.slots.get(&slot).cloned()
    }
}
