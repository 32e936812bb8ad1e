use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Number of save-state slots reachable through controls.
pub const SAVE_STATE_SLOTS: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Every input the console understands, from joysticks to front-panel
/// switches and host-side conveniences.
pub enum Control {
    Joy0Up,
    Joy0Down,
    Joy0Left,
    Joy0Right,
    Joy0Fire,
    Joy1Up,
    Joy1Down,
    Joy1Left,
    Joy1Right,
    Joy1Fire,
    Paddle0,
    Paddle1,
    Paddle0Fire,
    Paddle1Fire,
    Power,
    BlackWhite,
    Select,
    Reset,
    Difficulty0,
    Difficulty1,
    PowerFry,
    FastSpeed,
    SaveState(u8),
    LoadState(u8),
}

impl Control {
    /// Controls that only make sense on the machine running the
    /// authoritative simulation. They are applied where they are received
    /// and never replicated as control changes.
    pub const fn is_local_only(self) -> bool {
        matches!(
            self,
            Control::PowerFry | Control::FastSpeed | Control::SaveState(_) | Control::LoadState(_)
        )
    }

    /// Controls that carry an absolute position instead of a pressed state.
    pub const fn is_positional(self) -> bool {
        matches!(self, Control::Paddle0 | Control::Paddle1)
    }

    /// Parses the lowercase names used by configuration files and the CLI.
    pub fn from_name(name: &str) -> Option<Self> {
        let control = match name {
            "up" | "joy0-up" => Control::Joy0Up,
            "down" | "joy0-down" => Control::Joy0Down,
            "left" | "joy0-left" => Control::Joy0Left,
            "right" | "joy0-right" => Control::Joy0Right,
            "fire" | "joy0-fire" => Control::Joy0Fire,
            "joy1-up" => Control::Joy1Up,
            "joy1-down" => Control::Joy1Down,
            "joy1-left" => Control::Joy1Left,
            "joy1-right" => Control::Joy1Right,
            "joy1-fire" => Control::Joy1Fire,
            "paddle0" => Control::Paddle0,
            "paddle1" => Control::Paddle1,
            "paddle0-fire" => Control::Paddle0Fire,
            "paddle1-fire" => Control::Paddle1Fire,
            "power" => Control::Power,
            "bw" | "black-white" => Control::BlackWhite,
            "select" => Control::Select,
            "reset" => Control::Reset,
            "difficulty0" => Control::Difficulty0,
            "difficulty1" => Control::Difficulty1,
            "fry" | "power-fry" => Control::PowerFry,
            "fast" | "fast-speed" => Control::FastSpeed,
            _ => return None,
        };
        Some(control)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// One input event as it travels between roles.
///
/// Discrete edges and analog positions are separate variants so decoding
/// never has to guess which payload a change carries.
pub enum ControlChange {
    State { control: Control, state: bool },
    Position { control: Control, position: i32 },
}

impl ControlChange {
    pub const fn state(control: Control, state: bool) -> Self {
        ControlChange::State { control, state }
    }

    pub const fn position(control: Control, position: i32) -> Self {
        ControlChange::Position { control, position }
    }

    pub const fn control(&self) -> Control {
        match *self {
            ControlChange::State { control, .. } | ControlChange::Position { control, .. } => {
                control
            }
        }
    }

    pub const fn is_local_only(&self) -> bool {
        self.control().is_local_only()
    }
}

/// Receiver of control changes (machine peripherals, frontends, recorders).
pub trait ControlsInput: Send {
    fn control_state_changed(&mut self, control: Control, state: bool);

    fn control_position_changed(&mut self, control: Control, position: i32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u32);

/// In-process fan-out hub for control changes.
///
/// Every dispatched change is forwarded to all listeners in registration
/// order, and the latest value of each control is kept so it can be queried
/// later.
#[derive(Default)]
pub struct ControlsSocket {
    listeners: Vec<(ListenerId, Box<dyn ControlsInput>)>,
    next_id: u32,
    states: HashMap<Control, bool>,
    positions: HashMap<Control, i32>,
}

impl ControlsSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Box<dyn ControlsInput>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Box<dyn ControlsInput>> {
        let idx = self.listeners.iter().position(|(lid, _)| *lid == id)?;
        Some(self.listeners.remove(idx).1)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn dispatch(&mut self, change: &ControlChange) {
        match *change {
            ControlChange::State { control, state } => {
                self.states.insert(control, state);
                for (_, listener) in &mut self.listeners {
                    listener.control_state_changed(control, state);
                }
            }
            ControlChange::Position { control, position } => {
                self.positions.insert(control, position);
                for (_, listener) in &mut self.listeners {
                    listener.control_position_changed(control, position);
                }
            }
        }
    }

    /// Last dispatched state of `control`; `false` if never dispatched.
    pub fn state(&self, control: Control) -> bool {
        self.states.get(&control).copied().unwrap_or(false)
    }

    pub fn position(&self, control: Control) -> Option<i32> {
        self.positions.get(&control).copied()
    }

    /// Forgets the reported values, e.g. after a full state load redefined
    /// what the machine considers pressed.
    pub fn reset_report(&mut self) {
        self.states.clear();
        self.positions.clear();
    }
}
