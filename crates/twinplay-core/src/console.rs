use log::{info, warn};

use crate::clock::ClockDriven;
use crate::controls::{Control, ControlChange, ControlsSocket};
use crate::machine::{Machine, MachineError, SaveStateMedia, Snapshot};

/// Clock speed multiplier applied while fast speed is held.
pub const ALTERNATE_CLOCK_FACTOR: f64 = 4.0;

/// What applying a control change did beyond routing it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConsoleEffect {
    /// The machine state was replaced or corrupted outside normal execution;
    /// any mirror of it needs a full snapshot.
    pub state_replaced: bool,
    /// The clock driving this console should run at this rate from now on.
    pub clock_rate: Option<f64>,
}

/// A machine plus the console-level control semantics (power switch,
/// memory corruption, save-state slots, fast speed) shared by every role.
pub struct Console<M: Machine> {
    machine: M,
    controls: ControlsSocket,
    media: Option<Box<dyn SaveStateMedia>>,
    fast_speed: bool,
}

impl<M: Machine> Console<M> {
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            controls: ControlsSocket::new(),
            media: None,
            fast_speed: false,
        }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn controls(&self) -> &ControlsSocket {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlsSocket {
        &mut self.controls
    }

    pub fn set_save_state_media(&mut self, media: Option<Box<dyn SaveStateMedia>>) {
        self.media = media;
    }

    pub fn has_save_state_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_powered(&self) -> bool {
        self.machine.is_powered()
    }

    pub fn power_on(&mut self) {
        if self.machine.is_powered() {
            self.machine.power_off();
        }
        self.machine.power_on();
        self.controls.reset_report();
    }

    pub fn power_off(&mut self) {
        self.machine.power_off();
        self.controls.reset_report();
    }

    pub fn is_fast_speed(&self) -> bool {
        self.fast_speed
    }

    pub fn normal_rate(&self) -> f64 {
        self.machine.video_standard().fps()
    }

    pub fn current_rate(&self) -> f64 {
        if self.fast_speed {
            self.normal_rate() * ALTERNATE_CLOCK_FACTOR
        } else {
            self.normal_rate()
        }
    }

    pub fn save_state(&self) -> Result<Snapshot, MachineError> {
        self.machine.save_state()
    }

    pub fn load_state(&mut self, snapshot: &Snapshot) -> Result<(), MachineError> {
        self.machine.load_state(snapshot)?;
        self.controls.reset_report();
        Ok(())
    }

    /// Advance one pulse if powered.
    pub fn pulse(&mut self) {
        if self.machine.is_powered() {
            self.machine.clock_pulse();
        }
    }

    /// Route one control change through the socket and act on it.
    pub fn apply(&mut self, change: &ControlChange) -> ConsoleEffect {
        self.controls.dispatch(change);
        let mut effect = ConsoleEffect::default();

        match *change {
            ControlChange::State {
                control: Control::FastSpeed,
                state,
            } => {
                self.fast_speed = state;
                effect.clock_rate = Some(self.current_rate());
            }
            ControlChange::State {
                control:
                    Control::Power | Control::PowerFry | Control::SaveState(_) | Control::LoadState(_),
                state: false,
            } => {}
            ControlChange::State {
                control: Control::Power,
                ..
            } => {
                if self.machine.is_powered() {
                    self.power_off();
                } else {
                    self.power_on();
                }
            }
            ControlChange::State {
                control: Control::PowerFry,
                ..
            } => {
                if self.machine.is_powered() {
                    self.machine.power_fry();
                    effect.state_replaced = true;
                }
            }
            ControlChange::State {
                control: Control::SaveState(slot),
                ..
            } => self.save_to_slot(slot),
            ControlChange::State {
                control: Control::LoadState(slot),
                ..
            } => effect.state_replaced = self.load_from_slot(slot),
            _ => self.machine.control_changed(change),
        }

        effect
    }

    fn save_to_slot(&mut self, slot: u8) {
        if !self.machine.is_powered() {
            return;
        }
        let Some(media) = self.media.as_mut() else {
            return;
        };
        match self.machine.save_state() {
            Ok(snapshot) => {
                if media.save_state(slot, &snapshot) {
                    info!("Console: state {slot} saved");
                } else {
                    warn!("Console: state {slot} save failed");
                }
            }
            Err(e) => warn!("Console: state {slot} save failed: {e}"),
        }
    }

    fn load_from_slot(&mut self, slot: u8) -> bool {
        let Some(snapshot) = self.media.as_mut().and_then(|m| m.load_state(slot)) else {
            warn!("Console: state {slot} load failed");
            return false;
        };
        if !self.machine.is_powered() {
            self.power_on();
        }
        match self.load_state(&snapshot) {
            Ok(()) => {
                info!("Console: state {slot} loaded");
                true
            }
            Err(e) => {
                warn!("Console: state {slot} load failed: {e}");
                false
            }
        }
    }
}

impl<M: Machine> ClockDriven for Console<M> {
    fn clock_pulse(&mut self) {
        self.pulse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoMachine;
    use crate::machine::MemorySaveStateMedia;

    fn powered_console() -> Console<DemoMachine> {
        let mut console = Console::new(DemoMachine::new());
        console.apply(&ControlChange::state(Control::Power, true));
        console
    }

    #[test]
    fn power_press_toggles_and_release_is_ignored() {
        let mut console = Console::new(DemoMachine::new());
        assert!(!console.is_powered());
        console.apply(&ControlChange::state(Control::Power, true));
        assert!(console.is_powered());
        console.apply(&ControlChange::state(Control::Power, false));
        assert!(console.is_powered());
        console.apply(&ControlChange::state(Control::Power, true));
        assert!(!console.is_powered());
    }

    #[test]
    fn pulse_only_advances_when_powered() {
        let mut console = Console::new(DemoMachine::new());
        console.pulse();
        assert_eq!(console.machine().frame(), 0);
        console.apply(&ControlChange::state(Control::Power, true));
        console.pulse();
        console.pulse();
        assert_eq!(console.machine().frame(), 2);
    }

    #[test]
    fn fast_speed_reports_alternate_rate() {
        let mut console = powered_console();
        let effect = console.apply(&ControlChange::state(Control::FastSpeed, true));
        assert_eq!(effect.clock_rate, Some(60.0 * ALTERNATE_CLOCK_FACTOR));
        assert!(!effect.state_replaced);
        let effect = console.apply(&ControlChange::state(Control::FastSpeed, false));
        assert_eq!(effect.clock_rate, Some(60.0));
    }

    #[test]
    fn power_fry_marks_state_replaced() {
        let mut console = powered_console();
        console.pulse();
        let before = console.machine().digest();
        let effect = console.apply(&ControlChange::state(Control::PowerFry, true));
        assert!(effect.state_replaced);
        assert_ne!(console.machine().digest(), before);
    }

    #[test]
    fn save_and_load_slots_round_trip_through_media() {
        let mut console = powered_console();
        console.set_save_state_media(Some(Box::new(MemorySaveStateMedia::new())));
        console.pulse();
        console.apply(&ControlChange::state(Control::SaveState(2), true));
        let saved = console.machine().digest();

        console.pulse();
        console.pulse();
        assert_ne!(console.machine().digest(), saved);

        let effect = console.apply(&ControlChange::state(Control::LoadState(2), true));
        assert!(effect.state_replaced);
        assert_eq!(console.machine().digest(), saved);

        let effect = console.apply(&ControlChange::state(Control::LoadState(7), true));
        assert!(!effect.state_replaced);
    }

    #[test]
    fn machine_controls_reach_machine_and_socket() {
        let mut console = powered_console();
        console.apply(&ControlChange::state(Control::Joy0Fire, true));
        console.apply(&ControlChange::position(Control::Paddle0, 37));
        assert!(console.machine().is_pressed(Control::Joy0Fire));
        assert_eq!(console.machine().paddle(0), 37);
        assert!(console.controls().state(Control::Joy0Fire));
        assert_eq!(console.controls().position(Control::Paddle0), Some(37));
    }
}
