//! Host-side network worker.
//!
//! Accepts one peer at a time and runs the lockstep cycle with it: send one
//! queued envelope, wait for the peer's control batch, hand that batch to
//! the host, repeat.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use twinplay_core::controls::ControlChange;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::queue::UpdateQueue;
use crate::status::{ConnectionState, LinkEvent, SharedConnectionState};
use crate::wire::{self, ControlBatch, UpdateEnvelope};

/// The host simulation as seen from the transmitter.
pub trait HostEndpoint: Send + Sync {
    /// A new peer needs a full snapshot in the first envelope tagged with
    /// `session`.
    fn peer_connected(&self, session: u64);

    fn peer_disconnected(&self);

    fn peer_control_changes(&self, changes: Vec<ControlChange>);
}

/// Where the host simulation hands off its per-tick envelopes.
pub trait UpdateSink: Send + Sync {
    /// Identifier of the current peer session, `None` without a peer.
    fn peer_session(&self) -> Option<u64>;

    /// Queue an envelope built for `session`. Blocks while the queue is full.
    /// Envelopes for a session that already ended are dropped.
    fn send_update(&self, session: u64, update: UpdateEnvelope);
}

struct Shared {
    endpoint: Arc<dyn HostEndpoint>,
    events: Option<cb::Sender<LinkEvent>>,
    updates: UpdateQueue<(u64, UpdateEnvelope)>,
    started: AtomicBool,
    session: AtomicU64,
    next_session: AtomicU64,
    port: AtomicU16,
    state: SharedConnectionState,
    stream: Mutex<Option<TcpStream>>,
    poll_interval: Duration,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    fn current_session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    fn session_alive(&self, session: u64) -> bool {
        self.started.load(Ordering::Acquire) && self.current_session() == session
    }

    fn close_stream(&self) {
        if let Ok(mut slot) = self.stream.lock()
            && let Some(stream) = slot.take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl UpdateSink for Shared {
    fn peer_session(&self) -> Option<u64> {
        match self.current_session() {
            0 => None,
            session => Some(session),
        }
    }

    fn send_update(&self, session: u64, update: UpdateEnvelope) {
        if !self.session_alive(session) {
            trace!("Transmitter: dropping update for ended session {session}");
            return;
        }
        if self
            .updates
            .push((session, update), self.poll_interval, || {
                self.session_alive(session)
            })
            .is_err()
        {
            debug!("Transmitter: session {session} ended while waiting for queue space");
        }
    }
}

pub struct Transmitter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Transmitter {
    pub fn new(
        config: &LinkConfig,
        endpoint: Arc<dyn HostEndpoint>,
        events: Option<cb::Sender<LinkEvent>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                events,
                updates: UpdateQueue::bounded(config.max_pending_updates),
                started: AtomicBool::new(false),
                session: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                port: AtomicU16::new(0),
                state: SharedConnectionState::default(),
                stream: Mutex::new(None),
                poll_interval: config.poll_interval(),
            }),
            worker: None,
        }
    }

    /// Handle the host simulation uses to queue envelopes.
    pub fn sink(&self) -> Arc<dyn UpdateSink> {
        self.shared.clone()
    }

    /// Binds `port` (0 picks a free one) and starts waiting for a peer.
    /// Returns the bound port.
    pub fn start(&mut self, port: u16) -> Result<u16, LinkError> {
        if self.shared.started.load(Ordering::Acquire) {
            return Err(LinkError::AlreadyStarted);
        }
        self.join_worker();

        let listener = bind_listener(port).map_err(|source| LinkError::Bind { port, source })?;
        let bound = listener.local_addr()?.port();

        self.shared.port.store(bound, Ordering::Release);
        self.shared.started.store(true, Ordering::Release);
        self.shared.state.set(ConnectionState::Listening);

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("Transmitter".to_string())
            .spawn(move || transmitter_thread_main(shared, listener));
        match worker {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                self.shared.started.store(false, Ordering::Release);
                self.shared.state.set(ConnectionState::Idle);
                return Err(LinkError::Io(e));
            }
        }

        info!("Transmitter: listening on port {bound}");
        self.shared.emit(LinkEvent::Listening { port: bound });
        Ok(bound)
    }

    /// Closes the listener and any peer connection, then waits for the
    /// worker to finish.
    pub fn stop(&mut self) {
        if !self.shared.started.swap(false, Ordering::AcqRel) && self.worker.is_none() {
            return;
        }
        self.shared.close_stream();
        self.join_worker();
        self.shared.state.set(ConnectionState::Idle);
        info!("Transmitter: stopped");
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn is_peer_connected(&self) -> bool {
        self.shared.peer_session().is_some()
    }

    /// Port bound by the last successful [`Transmitter::start`].
    pub fn local_port(&self) -> Option<u16> {
        match self.shared.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Transmitter: worker panicked");
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true).ok();
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn transmitter_thread_main(shared: Arc<Shared>, listener: TcpListener) {
    let mut listener = Some(listener);

    while shared.started.load(Ordering::Acquire) {
        let current = match listener.take() {
            Some(l) => l,
            None => {
                let port = shared.port.load(Ordering::Acquire);
                match bind_listener(port) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("Transmitter: failed to listen on port {port}: {e}");
                        shared.emit(LinkEvent::Error(format!("listen on port {port}: {e}")));
                        thread::sleep(shared.poll_interval);
                        continue;
                    }
                }
            }
        };
        shared.state.set(ConnectionState::Listening);

        let Some((stream, addr)) = accept_peer(&shared, &current) else {
            break;
        };
        // Further peers are refused until this one leaves.
        drop(current);

        run_session(&shared, stream, addr);
    }

    shared.state.set(ConnectionState::Idle);
    debug!("Transmitter: worker exiting");
}

fn accept_peer(shared: &Shared, listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
    while shared.started.load(Ordering::Acquire) {
        match listener.accept() {
            Ok(accepted) => return Some(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("Transmitter: listener accept error: {e}"),
        }
        thread::sleep(shared.poll_interval);
    }
    None
}

fn run_session(shared: &Shared, mut stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("Transmitter: failed to set blocking mode for {addr}: {e}");
        return;
    }
    let _ = stream.set_nodelay(true);

    if let Ok(mut slot) = shared.stream.lock() {
        *slot = stream.try_clone().ok();
    }
    // stop() may have run before the clone was stored.
    if !shared.started.load(Ordering::Acquire) {
        shared.close_stream();
        return;
    }

    let session = shared.next_session.fetch_add(1, Ordering::AcqRel);
    let stale = shared.updates.clear();
    if stale > 0 {
        debug!("Transmitter: discarded {stale} stale updates");
    }
    // The host must see the connect notice no later than the session id.
    shared.endpoint.peer_connected(session);
    shared.session.store(session, Ordering::Release);
    shared.state.set(ConnectionState::Connected);
    info!("Transmitter: peer {addr} connected (session {session})");
    shared.emit(LinkEvent::PeerConnected { addr });

    match session_loop(shared, &mut stream, session) {
        Ok(()) => debug!("Transmitter: session {session} closed"),
        Err(e) if shared.started.load(Ordering::Acquire) => {
            warn!("Transmitter: connection to {addr} lost: {e}");
        }
        Err(e) => debug!("Transmitter: session {session} closed during stop: {e}"),
    }

    shared.session.store(0, Ordering::Release);
    shared.close_stream();
    let _ = stream.shutdown(Shutdown::Both);
    shared.updates.clear();
    shared.endpoint.peer_disconnected();
    shared.state.set(ConnectionState::Disconnected);
    info!("Transmitter: peer {addr} disconnected");
    shared.emit(LinkEvent::PeerDisconnected);
}

fn session_loop(shared: &Shared, stream: &mut TcpStream, session: u64) -> Result<(), LinkError> {
    while let Some((tag, update)) = shared
        .updates
        .pop(shared.poll_interval, || shared.session_alive(session))
    {
        if tag != session {
            trace!("Transmitter: skipping update from session {tag}");
            continue;
        }
        trace!(
            "Transmitter: sending update (snapshot: {}, changes: {})",
            update.has_snapshot(),
            update.control_changes.as_ref().map_or(0, Vec::len)
        );
        wire::write_frame(stream, &update)?;

        let reply: ControlBatch = wire::read_frame(stream)?;
        if let Some(changes) = reply
            && !changes.is_empty()
        {
            trace!("Transmitter: peer sent {} control changes", changes.len());
            shared.endpoint.peer_control_changes(changes);
        }
    }
    Ok(())
}
