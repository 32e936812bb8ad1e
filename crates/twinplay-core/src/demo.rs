//! A tiny deterministic machine.
//!
//! It has no CPU; each pulse folds the latched inputs into a pseudo-random
//! stream that is written into RAM, so any divergence in input timing between
//! two copies shows up in [`DemoMachine::digest`] within a frame.

use std::hash::{DefaultHasher, Hash, Hasher};

use log::trace;
use serde::{Deserialize, Serialize};

use crate::controls::{Control, ControlChange};
use crate::machine::{Machine, MachineError, Snapshot, VideoStandard};

pub const DEMO_RAM_SIZE: usize = 128;

const LCG_MUL: u32 = 1_664_525;
const LCG_INC: u32 = 1_013_904_223;
const POWER_ON_SEED: u32 = 0x2600_1977;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct DemoState {
    powered: bool,
    frame: u64,
    seed: u32,
    inputs: u32,
    paddles: [i32; 2],
    ram: Vec<u8>,
    video_standard: VideoStandard,
}

impl DemoState {
    fn new(video_standard: VideoStandard) -> Self {
        Self {
            powered: false,
            frame: 0,
            seed: POWER_ON_SEED,
            inputs: 0,
            paddles: [0; 2],
            ram: vec![0; DEMO_RAM_SIZE],
            video_standard,
        }
    }
}

fn input_bit(control: Control) -> Option<u32> {
    let bit = match control {
        Control::Joy0Up => 0,
        Control::Joy0Down => 1,
        Control::Joy0Left => 2,
        Control::Joy0Right => 3,
        Control::Joy0Fire => 4,
        Control::Joy1Up => 5,
        Control::Joy1Down => 6,
        Control::Joy1Left => 7,
        Control::Joy1Right => 8,
        Control::Joy1Fire => 9,
        Control::Paddle0Fire => 10,
        Control::Paddle1Fire => 11,
        Control::BlackWhite => 12,
        Control::Select => 13,
        Control::Reset => 14,
        Control::Difficulty0 => 15,
        Control::Difficulty1 => 16,
        _ => return None,
    };
    Some(bit)
}

fn lcg(seed: u32) -> u32 {
    seed.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC)
}

#[derive(Clone, Debug)]
pub struct DemoMachine {
    state: DemoState,
}

impl Default for DemoMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoMachine {
    pub fn new() -> Self {
        Self::with_video_standard(VideoStandard::Ntsc)
    }

    pub fn with_video_standard(video_standard: VideoStandard) -> Self {
        Self {
            state: DemoState::new(video_standard),
        }
    }

    pub fn frame(&self) -> u64 {
        self.state.frame
    }

    pub fn ram(&self) -> &[u8] {
        &self.state.ram
    }

    pub fn is_pressed(&self, control: Control) -> bool {
        input_bit(control).is_some_and(|bit| self.state.inputs & (1 << bit) != 0)
    }

    /// Position of paddle `index` (0 or 1); other indices read as 0.
    pub fn paddle(&self, index: usize) -> i32 {
        self.state.paddles.get(index).copied().unwrap_or(0)
    }

    /// Hash of the complete machine state.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.state.hash(&mut hasher);
        hasher.finish()
    }
}

impl Machine for DemoMachine {
    fn power_on(&mut self) {
        let video_standard = self.state.video_standard;
        let inputs = self.state.inputs;
        let paddles = self.state.paddles;
        self.state = DemoState::new(video_standard);
        self.state.inputs = inputs;
        self.state.paddles = paddles;
        self.state.powered = true;
    }

    fn power_off(&mut self) {
        self.state.powered = false;
    }

    fn is_powered(&self) -> bool {
        self.state.powered
    }

    fn clock_pulse(&mut self) {
        let s = &mut self.state;
        s.frame = s.frame.wrapping_add(1);
        let mix = s.inputs ^ (s.paddles[0] as u32).rotate_left(8) ^ (s.paddles[1] as u32).rotate_left(20);
        s.seed = lcg(s.seed ^ mix);
        let addr = (s.frame as usize) % DEMO_RAM_SIZE;
        s.ram[addr] = s.ram[addr].wrapping_add((s.seed >> 24) as u8);
    }

    fn save_state(&self) -> Result<Snapshot, MachineError> {
        bincode::serialize(&self.state)
            .map(Snapshot::new)
            .map_err(MachineError::Encode)
    }

    fn load_state(&mut self, snapshot: &Snapshot) -> Result<(), MachineError> {
        let state: DemoState =
            bincode::deserialize(snapshot.as_bytes()).map_err(MachineError::Decode)?;
        if state.ram.len() != DEMO_RAM_SIZE {
            return Err(MachineError::InvalidSnapshot(format!(
                "expected {DEMO_RAM_SIZE} bytes of RAM, got {}",
                state.ram.len()
            )));
        }
        self.state = state;
        Ok(())
    }

    fn control_changed(&mut self, change: &ControlChange) {
        match *change {
            ControlChange::State { control, state } => {
                if let Some(bit) = input_bit(control) {
                    if state {
                        self.state.inputs |= 1 << bit;
                    } else {
                        self.state.inputs &= !(1 << bit);
                    }
                }
            }
            ControlChange::Position { control, position } => match control {
                Control::Paddle0 => self.state.paddles[0] = position,
                Control::Paddle1 => self.state.paddles[1] = position,
                other => trace!("Demo: ignoring position for {other:?}"),
            },
        }
    }

    fn power_fry(&mut self) {
        let mut seed = lcg(self.state.seed ^ self.state.frame as u32);
        for byte in &mut self.state.ram {
            seed = lcg(seed);
            *byte ^= ((seed >> 16) as u8) | 1;
        }
    }

    fn video_standard(&self) -> VideoStandard {
        self.state.video_standard
    }
}
