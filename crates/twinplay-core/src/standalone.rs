use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::console::Console;
use crate::controls::{Control, ControlChange};
use crate::machine::Machine;

/// Single-player console: its own clock, input applied as soon as it
/// arrives.
pub struct StandaloneConsole<M: Machine + 'static> {
    console: Arc<Mutex<Console<M>>>,
    clock: Clock,
}

impl<M: Machine + 'static> StandaloneConsole<M> {
    pub fn new(machine: M) -> io::Result<Self> {
        let console = Console::new(machine);
        let rate = console.normal_rate();
        let console = Arc::new(Mutex::new(console));
        let clock = Clock::spawn("Standalone Console", Arc::clone(&console), rate)?;
        clock.go();
        Ok(Self { console, clock })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn control_state_changed(&self, control: Control, state: bool) {
        self.apply(ControlChange::state(control, state));
    }

    pub fn control_position_changed(&self, control: Control, position: i32) {
        self.apply(ControlChange::position(control, position));
    }

    pub fn apply(&self, change: ControlChange) {
        let effect = match self.console.lock() {
            Ok(mut console) => console.apply(&change),
            Err(_) => return,
        };
        if let Some(rate) = effect.clock_rate {
            self.clock.set_rate(rate);
        }
    }

    pub fn pause(&self) {
        self.clock.pause();
    }

    pub fn go(&self) {
        self.clock.go();
    }

    /// Locks the console for inspection or direct manipulation.
    pub fn console(&self) -> Option<MutexGuard<'_, Console<M>>> {
        self.console.lock().ok()
    }

    pub fn terminate(&mut self) {
        self.clock.terminate();
    }
}
