//! The authoritative side of a session.
//!
//! The host runs the simulation on its own clock. Every tick it applies the
//! input gathered since the previous tick and, while a peer is attached,
//! sends that input (plus a full snapshot when one is due) so the peer can
//! replay the same tick.

use std::sync::{Arc, Mutex};

use crossbeam_channel as cb;
use log::{debug, info, warn};
use twinplay_core::clock::{Clock, ClockControl, ClockDriven};
use twinplay_core::console::{Console, ConsoleEffect};
use twinplay_core::controls::{Control, ControlChange};
use twinplay_core::machine::{Machine, SaveStateMedia, Snapshot};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::status::{ConnectionState, LinkEvent};
use crate::transmitter::{HostEndpoint, Transmitter, UpdateSink};
use crate::wire::UpdateEnvelope;

pub type MachineMutation<M> = Box<dyn FnOnce(&mut M) + Send>;

/// Work for the host clock thread. Everything that changes the host
/// simulation arrives this way.
pub enum HostMessage<M> {
    Input(ControlChange),
    /// A peer attached under the given session id.
    PeerConnected(u64),
    PeerDisconnected,
    LoadState(Snapshot),
    /// Direct machine change outside normal input, e.g. a cartridge swap.
    Mutate(MachineMutation<M>),
}

struct HostInbox<M> {
    tx: cb::Sender<HostMessage<M>>,
}

impl<M: Send> HostEndpoint for HostInbox<M> {
    fn peer_connected(&self, session: u64) {
        let _ = self.tx.send(HostMessage::PeerConnected(session));
    }

    fn peer_disconnected(&self) {
        let _ = self.tx.send(HostMessage::PeerDisconnected);
    }

    fn peer_control_changes(&self, changes: Vec<ControlChange>) {
        for change in changes {
            let _ = self.tx.send(HostMessage::Input(change));
        }
    }
}

/// Host simulation state. Only the clock thread changes it.
pub struct HostCore<M: Machine> {
    console: Console<M>,
    inbox: cb::Receiver<HostMessage<M>>,
    clock: Option<ClockControl>,
    state_dirty: bool,
    /// Session whose first envelope has not carried a snapshot yet.
    snapshot_owed: Option<u64>,
}

impl<M: Machine> HostCore<M> {
    pub fn new(console: Console<M>, inbox: cb::Receiver<HostMessage<M>>) -> Self {
        Self {
            console,
            inbox,
            clock: None,
            state_dirty: false,
            snapshot_owed: None,
        }
    }

    /// Lets fast speed retune the clock that drives this core.
    pub fn attach_clock(&mut self, clock: ClockControl) {
        self.clock = Some(clock);
    }

    pub fn console(&self) -> &Console<M> {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console<M> {
        &mut self.console
    }

    pub fn is_state_dirty(&self) -> bool {
        self.state_dirty
    }

    /// Session still waiting for its opening snapshot.
    pub fn snapshot_owed(&self) -> Option<u64> {
        self.snapshot_owed
    }

    /// One host tick. `session` is the peer session observed before the
    /// tick began; the envelope for it is returned rather than sent so the
    /// caller can block on the queue without holding the core.
    pub fn tick(&mut self, session: Option<u64>) -> Option<(u64, UpdateEnvelope)> {
        let messages: Vec<_> = self.inbox.try_iter().collect();
        let mut control_changes = Vec::new();
        for message in messages {
            match message {
                HostMessage::Input(change) if change.is_local_only() => {
                    let effect = self.console.apply(&change);
                    self.handle_effect(effect);
                }
                HostMessage::Input(change) => control_changes.push(change),
                HostMessage::PeerConnected(id) => {
                    debug!("Host: peer attached (session {id}), full state due");
                    self.snapshot_owed = Some(id);
                }
                HostMessage::PeerDisconnected => debug!("Host: peer detached"),
                HostMessage::LoadState(snapshot) => match self.console.load_state(&snapshot) {
                    Ok(()) => self.state_dirty = true,
                    Err(e) => warn!("Host: state load failed: {e}"),
                },
                HostMessage::Mutate(mutate) => {
                    mutate(self.console.machine_mut());
                    self.state_dirty = true;
                }
            }
        }

        let mut power_change = None;
        let mut snapshot = None;
        // The session read before the drain may be stale. An owed snapshot
        // only counts as paid once it rides an envelope tagged for its session.
        let owed_here = session.is_some() && self.snapshot_owed == session;
        match session {
            Some(_) if self.state_dirty || owed_here => match self.console.save_state() {
                Ok(state) => {
                    power_change = Some(self.console.is_powered());
                    snapshot = Some(state);
                    self.state_dirty = false;
                    if owed_here {
                        self.snapshot_owed = None;
                    }
                }
                Err(e) => warn!("Host: snapshot failed, retrying next tick: {e}"),
            },
            Some(_) => {}
            None => self.state_dirty = false,
        }

        for change in &control_changes {
            let effect = self.console.apply(change);
            self.handle_effect(effect);
        }

        self.console.pulse();

        session.map(|session| {
            let update = UpdateEnvelope {
                power_change,
                snapshot,
                control_changes: (!control_changes.is_empty()).then_some(control_changes),
            };
            (session, update)
        })
    }

    fn handle_effect(&mut self, effect: ConsoleEffect) {
        if effect.state_replaced {
            self.state_dirty = true;
        }
        if let Some(rate) = effect.clock_rate
            && let Some(clock) = &self.clock
        {
            clock.set_rate(rate);
        }
    }
}

/// What the host clock drives: ticks the core, then hands the envelope to
/// the transmitter with the core unlocked.
pub struct HostTicker<M: Machine> {
    core: Arc<Mutex<HostCore<M>>>,
    link: Arc<dyn UpdateSink>,
}

impl<M: Machine> HostTicker<M> {
    pub fn new(core: Arc<Mutex<HostCore<M>>>, link: Arc<dyn UpdateSink>) -> Self {
        Self { core, link }
    }
}

impl<M: Machine> ClockDriven for HostTicker<M> {
    fn clock_pulse(&mut self) {
        // Read before the inbox is drained: a peer visible here has already
        // queued its connect notice.
        let session = self.link.peer_session();
        let outgoing = match self.core.lock() {
            Ok(mut core) => core.tick(session),
            Err(_) => return,
        };
        if let Some((session, update)) = outgoing {
            self.link.send_update(session, update);
        }
    }
}

/// Public handle for running a console as the host of a session.
pub struct HostConsole<M: Machine + 'static> {
    core: Arc<Mutex<HostCore<M>>>,
    inbox: cb::Sender<HostMessage<M>>,
    transmitter: Transmitter,
    clock: Clock,
}

impl<M: Machine + 'static> HostConsole<M> {
    /// Starts the host clock right away; the console runs locally whether or
    /// not a peer ever connects.
    pub fn new(
        machine: M,
        config: &LinkConfig,
        events: Option<cb::Sender<LinkEvent>>,
    ) -> Result<Self, LinkError> {
        let (tx, rx) = cb::unbounded();
        let transmitter = Transmitter::new(config, Arc::new(HostInbox { tx: tx.clone() }), events);

        let console = Console::new(machine);
        let rate = console.normal_rate();
        let core = Arc::new(Mutex::new(HostCore::new(console, rx)));
        let ticker = HostTicker::new(Arc::clone(&core), transmitter.sink());
        let clock = Clock::spawn("Host Console", Arc::new(Mutex::new(ticker)), rate)?;
        if let Ok(mut c) = core.lock() {
            c.attach_clock(clock.control());
        }
        clock.go();

        Ok(Self {
            core,
            inbox: tx,
            transmitter,
            clock,
        })
    }

    /// Opens `port` for a peer (0 picks a free one). Returns the bound port.
    pub fn start(&mut self, port: u16) -> Result<u16, LinkError> {
        self.transmitter.start(port)
    }

    /// Drops the peer, if any, and stops listening. The console keeps running.
    pub fn stop(&mut self) {
        self.transmitter.stop();
    }

    pub fn control_state_changed(&self, control: Control, state: bool) {
        self.apply(ControlChange::state(control, state));
    }

    pub fn control_position_changed(&self, control: Control, position: i32) {
        self.apply(ControlChange::position(control, position));
    }

    /// Queues a local control change for the next tick.
    pub fn apply(&self, change: ControlChange) {
        let _ = self.inbox.send(HostMessage::Input(change));
    }

    /// Replaces the machine state on the next tick and resends it to the peer.
    pub fn load_state(&self, snapshot: Snapshot) {
        let _ = self.inbox.send(HostMessage::LoadState(snapshot));
    }

    /// Runs `mutate` on the machine at the next tick and resends the full
    /// state to the peer afterwards.
    pub fn modify_machine(&self, mutate: impl FnOnce(&mut M) + Send + 'static) {
        let _ = self.inbox.send(HostMessage::Mutate(Box::new(mutate)));
    }

    pub fn set_save_state_media(&self, media: Option<Box<dyn SaveStateMedia>>) {
        if let Ok(mut core) = self.core.lock() {
            core.console_mut().set_save_state_media(media);
        }
    }

    /// Read access to the console between ticks.
    pub fn with_console<R>(&self, f: impl FnOnce(&Console<M>) -> R) -> Option<R> {
        self.core.lock().ok().map(|core| f(core.console()))
    }

    pub fn is_peer_connected(&self) -> bool {
        self.transmitter.is_peer_connected()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.transmitter.local_port()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transmitter.connection_state()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Stops the network side first so a tick blocked on a full queue can
    /// finish, then stops the clock.
    pub fn terminate(&mut self) {
        self.transmitter.stop();
        self.clock.terminate();
        info!("Host: terminated");
    }
}

impl<M: Machine + 'static> Drop for HostConsole<M> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use twinplay_core::demo::DemoMachine;
    use twinplay_core::machine::MemorySaveStateMedia;

    #[derive(Default)]
    struct FakeLink {
        session: AtomicU64,
        sent: Mutex<Vec<UpdateEnvelope>>,
        send_calls: AtomicUsize,
    }

    impl UpdateSink for FakeLink {
        fn peer_session(&self) -> Option<u64> {
            match self.session.load(Ordering::SeqCst) {
                0 => None,
                s => Some(s),
            }
        }

        fn send_update(&self, _session: u64, update: UpdateEnvelope) {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().expect("sent").push(update);
        }
    }

    struct Harness {
        core: Arc<Mutex<HostCore<DemoMachine>>>,
        ticker: HostTicker<DemoMachine>,
        inbox: cb::Sender<HostMessage<DemoMachine>>,
        link: Arc<FakeLink>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = cb::unbounded();
            let link = Arc::new(FakeLink::default());
            let core = Arc::new(Mutex::new(HostCore::new(Console::new(DemoMachine::new()), rx)));
            let ticker = HostTicker::new(Arc::clone(&core), link.clone());
            Self {
                core,
                ticker,
                inbox: tx,
                link,
            }
        }

        fn pulse(&mut self) {
            self.ticker.clock_pulse();
        }

        fn core(&self) -> std::sync::MutexGuard<'_, HostCore<DemoMachine>> {
            self.core.lock().expect("core")
        }

        fn input(&self, change: ControlChange) {
            self.inbox.send(HostMessage::Input(change)).expect("inbox");
        }

        fn attach_peer(&self) {
            self.announce_peer(1);
            self.link.session.store(1, Ordering::SeqCst);
        }

        fn announce_peer(&self, session: u64) {
            self.inbox
                .send(HostMessage::PeerConnected(session))
                .expect("inbox");
        }

        fn sent(&self) -> Vec<UpdateEnvelope> {
            std::mem::take(&mut *self.link.sent.lock().expect("sent"))
        }
    }

    #[test]
    fn queued_input_is_applied_and_sent_in_order() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        h.attach_peer();
        h.pulse();
        h.sent();

        h.input(ControlChange::state(Control::Joy0Fire, true));
        h.input(ControlChange::position(Control::Paddle0, 37));
        h.pulse();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].control_changes,
            Some(vec![
                ControlChange::state(Control::Joy0Fire, true),
                ControlChange::position(Control::Paddle0, 37),
            ])
        );
        assert!(!sent[0].has_snapshot());
        let core = h.core();
        let console = core.console();
        assert!(console.controls().state(Control::Joy0Fire));
        assert_eq!(console.controls().position(Control::Paddle0), Some(37));
    }

    #[test]
    fn without_peer_machine_runs_and_nothing_is_sent() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        for _ in 0..10 {
            h.pulse();
        }
        assert_eq!(h.core().console().machine().frame(), 10);
        assert_eq!(h.link.send_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn new_peer_gets_snapshot_first() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        h.pulse();
        assert!(!h.core().is_state_dirty());

        h.attach_peer();
        h.pulse();
        h.pulse();
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].has_snapshot());
        assert_eq!(sent[0].power_change, Some(true));
        assert!(sent[1].is_tick_only());
    }

    #[test]
    fn connect_drained_before_session_is_visible_still_snapshots() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        h.pulse();

        // The notice is drained by a tick that saw no peer yet.
        h.announce_peer(1);
        let outgoing = h.core().tick(None);
        assert!(outgoing.is_none());
        assert_eq!(h.core().snapshot_owed(), Some(1));

        let (tag, first) = h.core().tick(Some(1)).expect("envelope");
        assert_eq!(tag, 1);
        assert!(first.has_snapshot());
        assert_eq!(first.power_change, Some(true));
        assert_eq!(h.core().snapshot_owed(), None);
    }

    #[test]
    fn reconnect_drained_under_previous_session_still_snapshots() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        h.attach_peer();
        h.pulse();
        h.sent();

        // Session 1 ends and session 2 begins between the session read and
        // the drain. A mutation in the same tick spends the dirty flag on an
        // envelope the transmitter will discard.
        h.inbox.send(HostMessage::PeerDisconnected).expect("inbox");
        h.announce_peer(2);
        h.inbox
            .send(HostMessage::Mutate(Box::new(|m: &mut DemoMachine| m.clock_pulse())))
            .expect("inbox");
        let (tag, stale) = h.core().tick(Some(1)).expect("envelope");
        assert_eq!(tag, 1);
        assert!(stale.has_snapshot());
        assert_eq!(h.core().snapshot_owed(), Some(2));

        let (tag, first) = h.core().tick(Some(2)).expect("envelope");
        assert_eq!(tag, 2);
        assert!(first.has_snapshot(), "new session must open with a snapshot");
        let (_, next) = h.core().tick(Some(2)).expect("envelope");
        assert!(next.is_tick_only());
    }

    #[test]
    fn snapshot_is_taken_before_the_ticks_input() {
        let mut h = Harness::new();
        h.input(ControlChange::state(Control::Power, true));
        h.pulse();

        let before = h.core().console().machine().digest();
        h.attach_peer();
        h.input(ControlChange::state(Control::Joy0Up, true));
        h.pulse();

        let sent = h.sent();
        let mut replica = DemoMachine::new();
        replica
            .load_state(sent[0].snapshot.as_ref().expect("snapshot"))
            .expect("load");
        assert_eq!(replica.digest(), before);
        assert!(!replica.is_pressed(Control::Joy0Up));
    }

    #[test]
    fn dirty_flag_is_consumed_without_peer() {
        let mut h = Harness::new();
        h.inbox
            .send(HostMessage::Mutate(Box::new(|m: &mut DemoMachine| m.power_on())))
            .expect("inbox");
        h.pulse();
        assert!(!h.core().is_state_dirty());
        assert!(h.core().console().is_powered());
    }

    #[test]
    fn local_only_controls_stay_local() {
        let mut h = Harness::new();
        h.core()
            .console_mut()
            .set_save_state_media(Some(Box::new(MemorySaveStateMedia::new())));
        h.input(ControlChange::state(Control::Power, true));
        h.attach_peer();
        h.pulse();
        h.sent();

        h.input(ControlChange::state(Control::SaveState(1), true));
        h.input(ControlChange::state(Control::FastSpeed, true));
        h.pulse();
        let sent = h.sent();
        assert_eq!(sent[0].control_changes, None);
        assert!(!sent[0].has_snapshot());
        assert!(h.core().console().is_fast_speed());

        h.input(ControlChange::state(Control::PowerFry, true));
        h.pulse();
        let sent = h.sent();
        assert_eq!(sent[0].control_changes, None);
        assert!(sent[0].has_snapshot(), "fried memory must be resent");

        h.input(ControlChange::state(Control::LoadState(1), true));
        h.pulse();
        let sent = h.sent();
        assert!(sent[0].has_snapshot(), "loaded state must be resent");
        assert!(!h.core().is_state_dirty());
    }

    #[test]
    fn loaded_state_is_resent() {
        let mut h = Harness::new();
        let mut source = DemoMachine::new();
        source.power_on();
        source.clock_pulse();
        let snapshot = source.save_state().expect("save");

        h.attach_peer();
        h.pulse();
        h.sent();
        h.inbox
            .send(HostMessage::LoadState(snapshot.clone()))
            .expect("inbox");
        h.pulse();
        let sent = h.sent();
        assert_eq!(sent[0].snapshot, Some(snapshot));
        assert_eq!(h.core().console().machine().frame(), 2);
    }

    #[test]
    fn host_console_runs_without_peer() {
        let mut host =
            HostConsole::new(DemoMachine::new(), &LinkConfig::default(), None).expect("host");
        host.control_state_changed(Control::Power, true);
        std::thread::sleep(std::time::Duration::from_millis(120));
        let frames = host.with_console(|c| c.machine().frame()).expect("console");
        assert!(frames > 0);
        assert!(!host.is_peer_connected());
        assert_eq!(host.local_port(), None);

        host.control_state_changed(Control::FastSpeed, true);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(host.clock().rate(), 240.0);
        host.terminate();
    }
}
