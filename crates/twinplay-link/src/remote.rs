//! The mirroring side of a session.
//!
//! A remote has no clock: it advances exactly one step per host envelope,
//! after applying whatever that envelope carries. Its own input is only
//! queued here and takes effect once the host echoes it back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, trace};
use twinplay_core::console::Console;
use twinplay_core::controls::{Control, ControlChange};
use twinplay_core::machine::{Machine, MachineError};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::receiver::{Receiver, RemoteEndpoint};
use crate::status::{ConnectionState, LinkEvent};
use crate::wire::UpdateEnvelope;

/// Remote simulation state.
pub struct RemoteCore<M: Machine> {
    console: Console<M>,
    ticks: u64,
}

impl<M: Machine> RemoteCore<M> {
    pub fn new(console: Console<M>) -> Self {
        Self { console, ticks: 0 }
    }

    pub fn console(&self) -> &Console<M> {
        &self.console
    }

    /// Host ticks replayed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Applies power, then state, then control changes. Returns whether the
    /// machine is powered afterwards.
    pub fn apply_update(&mut self, update: UpdateEnvelope) -> Result<bool, MachineError> {
        if let Some(power) = update.power_change {
            if power && !self.console.is_powered() {
                self.console.power_on();
            } else if !power && self.console.is_powered() {
                self.console.power_off();
            }
        }
        if let Some(snapshot) = &update.snapshot {
            self.console.load_state(snapshot)?;
        }
        for change in update.control_changes.iter().flatten() {
            if change.is_local_only() {
                trace!("Remote: ignoring host-only control {:?}", change.control());
                continue;
            }
            self.console.apply(change);
        }
        Ok(self.console.is_powered())
    }

    /// Advances one step if powered.
    pub fn advance(&mut self) {
        if self.console.is_powered() {
            self.console.pulse();
            self.ticks += 1;
        }
    }

    /// Replays one host tick.
    pub fn receive_update(&mut self, update: UpdateEnvelope) -> Result<(), MachineError> {
        if self.apply_update(update)? {
            self.advance();
        }
        Ok(())
    }

    fn disconnected(&mut self) {
        self.console.power_off();
    }
}

struct RemoteLink<M: Machine> {
    core: Arc<Mutex<RemoteCore<M>>>,
    input: cb::Receiver<ControlChange>,
    paused: AtomicBool,
    linked: AtomicBool,
    poll_interval: Duration,
}

impl<M: Machine> RemoteLink<M> {
    fn wait_while_paused(&self) {
        while self.paused.load(Ordering::Acquire) && self.linked.load(Ordering::Acquire) {
            thread::sleep(self.poll_interval);
        }
    }
}

impl<M: Machine> RemoteEndpoint for RemoteLink<M> {
    fn connected(&self) {
        self.linked.store(true, Ordering::Release);
        info!("Remote: connected to host");
    }

    fn disconnected(&self) {
        self.linked.store(false, Ordering::Release);
        if let Ok(mut core) = self.core.lock() {
            core.disconnected();
        }
        let dropped = self.input.try_iter().count();
        if dropped > 0 {
            debug!("Remote: discarded {dropped} unsent inputs");
        }
        info!("Remote: disconnected from host");
    }

    fn receive_update(&self, update: UpdateEnvelope) -> Result<(), LinkError> {
        let powered = match self.core.lock() {
            // Only an envelope popped just before teardown gets here. It is
            // dropped whole so it cannot undo the power-off done on
            // disconnect; the next session opens with a snapshot anyway.
            Ok(_) if !self.linked.load(Ordering::Acquire) => return Ok(()),
            Ok(mut core) => core.apply_update(update)?,
            Err(_) => return Ok(()),
        };
        if !powered {
            return Ok(());
        }

        // Paused: hold the tick instead of skipping it, with the core
        // unlocked so observers can still read it.
        self.wait_while_paused();
        if let Ok(mut core) = self.core.lock()
            && self.linked.load(Ordering::Acquire)
        {
            core.advance();
        }
        Ok(())
    }

    fn take_control_changes(&self) -> Option<Vec<ControlChange>> {
        let changes: Vec<_> = self.input.try_iter().collect();
        (!changes.is_empty()).then_some(changes)
    }
}

/// Public handle for joining a host as its remote peer.
pub struct RemoteConsole<M: Machine + 'static> {
    core: Arc<Mutex<RemoteCore<M>>>,
    link: Arc<RemoteLink<M>>,
    input: cb::Sender<ControlChange>,
    receiver: Receiver,
}

impl<M: Machine + 'static> RemoteConsole<M> {
    pub fn new(machine: M, config: &LinkConfig, events: Option<cb::Sender<LinkEvent>>) -> Self {
        let (tx, rx) = cb::unbounded();
        let core = Arc::new(Mutex::new(RemoteCore::new(Console::new(machine))));
        let link = Arc::new(RemoteLink {
            core: Arc::clone(&core),
            input: rx,
            paused: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            poll_interval: config.poll_interval(),
        });
        let receiver = Receiver::new(config, link.clone(), events);
        Self {
            core,
            link,
            input: tx,
            receiver,
        }
    }

    /// Connects to a host at `address` (`host[:port]`).
    pub fn connect(&mut self, address: &str) -> Result<SocketAddr, LinkError> {
        self.receiver.connect(address)
    }

    pub fn disconnect(&mut self) {
        self.receiver.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.receiver.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.receiver.connection_state()
    }

    pub fn server_address(&self) -> Option<&str> {
        self.receiver.server_address()
    }

    pub fn control_state_changed(&self, control: Control, state: bool) {
        self.apply(ControlChange::state(control, state));
    }

    pub fn control_position_changed(&self, control: Control, position: i32) {
        self.apply(ControlChange::position(control, position));
    }

    /// Queues a local control change for the host. Nothing happens locally
    /// until the host sends it back.
    pub fn apply(&self, change: ControlChange) {
        if !self.receiver.is_connected() {
            trace!("Remote: not connected, dropping {:?}", change.control());
            return;
        }
        let _ = self.input.send(change);
    }

    /// Holds the next replayed tick until [`RemoteConsole::resume`].
    pub fn pause(&self) {
        self.link.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.link.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.link.paused.load(Ordering::Acquire)
    }

    pub fn with_console<R>(&self, f: impl FnOnce(&Console<M>) -> R) -> Option<R> {
        self.core.lock().ok().map(|core| f(core.console()))
    }

    pub fn ticks(&self) -> u64 {
        self.core.lock().map(|core| core.ticks()).unwrap_or(0)
    }
}

impl<M: Machine + 'static> Drop for RemoteConsole<M> {
    fn drop(&mut self) {
        self.receiver.disconnect();
    }
}
