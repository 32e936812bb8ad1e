//! Remote-side network workers.
//!
//! One thread reads envelopes and answers each with the locally queued
//! input; a second thread feeds the envelopes to the remote simulation so a
//! slow tick never delays the answer.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use twinplay_core::controls::ControlChange;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::queue::UpdateQueue;
use crate::status::{ConnectionState, LinkEvent, SharedConnectionState};
use crate::wire::{self, UpdateEnvelope};

/// The remote simulation as seen from the receiver.
pub trait RemoteEndpoint: Send + Sync {
    fn connected(&self);

    fn disconnected(&self);

    /// Replays one host tick. An error means the two sides no longer agree
    /// and the session is dropped.
    fn receive_update(&self, update: UpdateEnvelope) -> Result<(), LinkError>;

    /// Local input queued since the last call, `None` when there is none.
    fn take_control_changes(&self) -> Option<Vec<ControlChange>>;
}

struct Shared {
    endpoint: Arc<dyn RemoteEndpoint>,
    events: Option<cb::Sender<LinkEvent>>,
    updates: UpdateQueue<UpdateEnvelope>,
    connected: AtomicBool,
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

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Safe to call from any thread, any number of times.
    fn teardown(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if let Ok(mut slot) = self.stream.lock()
            && let Some(stream) = slot.take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.updates.clear();
        if was_connected {
            self.endpoint.disconnected();
            self.state.set(ConnectionState::Disconnected);
            info!("Receiver: disconnected");
            self.emit(LinkEvent::Disconnected);
        }
    }
}

pub struct Receiver {
    shared: Arc<Shared>,
    default_port: u16,
    connect_timeout: Duration,
    server_address: Option<String>,
    receive_worker: Option<JoinHandle<()>>,
    consumer_worker: Option<JoinHandle<()>>,
}

impl Receiver {
    pub fn new(
        config: &LinkConfig,
        endpoint: Arc<dyn RemoteEndpoint>,
        events: Option<cb::Sender<LinkEvent>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                events,
                updates: UpdateQueue::bounded(config.max_delivered_updates),
                connected: AtomicBool::new(false),
                state: SharedConnectionState::default(),
                stream: Mutex::new(None),
                poll_interval: config.poll_interval(),
            }),
            default_port: config.port,
            connect_timeout: config.connect_timeout(),
            server_address: None,
            receive_worker: None,
            consumer_worker: None,
        }
    }

    /// Connects to `address` (`host[:port]`) and starts the session workers.
    pub fn connect(&mut self, address: &str) -> Result<SocketAddr, LinkError> {
        if self.shared.is_connected() {
            return Err(LinkError::AlreadyConnected);
        }
        self.join_workers();

        let (host, port) = parse_address(address, self.default_port)?;
        let endpoint = format!("{host}:{port}");
        let addr = resolve_socket_addr(&host, port)
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))?;

        self.shared.state.set(ConnectionState::Connecting);
        debug!("Receiver: connecting to {endpoint} ({addr})");
        let stream = match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(stream) => stream,
            Err(source) => {
                self.shared.state.set(ConnectionState::Disconnected);
                warn!("Receiver: failed to connect to {endpoint}: {source}");
                self.shared
                    .emit(LinkEvent::Error(format!("connect to {endpoint}: {source}")));
                return Err(LinkError::Connect { endpoint, source });
            }
        };
        let _ = stream.set_nodelay(true);
        let worker_stream = stream.try_clone()?;

        self.shared.updates.clear();
        if let Some(stale) = self.shared.endpoint.take_control_changes() {
            debug!("Receiver: discarded {} inputs queued offline", stale.len());
        }
        if let Ok(mut slot) = self.shared.stream.lock() {
            *slot = Some(stream);
        }
        self.shared.connected.store(true, Ordering::Release);
        self.shared.endpoint.connected();
        self.shared.state.set(ConnectionState::Connected);
        self.server_address = Some(address.to_string());
        info!("Receiver: connected to {endpoint}");
        self.shared.emit(LinkEvent::Connected { addr });

        let shared = Arc::clone(&self.shared);
        let receive = thread::Builder::new()
            .name("Receiver".to_string())
            .spawn(move || receive_thread_main(shared, worker_stream));
        let shared = Arc::clone(&self.shared);
        let consume = thread::Builder::new()
            .name("Receiver Consumer".to_string())
            .spawn(move || consumer_thread_main(shared));
        self.receive_worker = receive.ok();
        self.consumer_worker = consume.ok();
        if self.receive_worker.is_none() || self.consumer_worker.is_none() {
            self.disconnect();
            return Err(LinkError::Io(io::Error::other(
                "failed to spawn receiver workers",
            )));
        }

        Ok(addr)
    }

    /// Closes the connection and waits for both workers to finish.
    pub fn disconnect(&mut self) {
        self.shared.teardown();
        self.join_workers();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Address given to the last successful [`Receiver::connect`].
    pub fn server_address(&self) -> Option<&str> {
        self.server_address.as_deref()
    }

    fn join_workers(&mut self) {
        for worker in [self.receive_worker.take(), self.consumer_worker.take()]
            .into_iter()
            .flatten()
        {
            if worker.join().is_err() {
                warn!("Receiver: worker panicked");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Splits `host[:port]`. Bracketed IPv6 literals are accepted, and a bare
/// IPv6 literal is taken as a host without port.
pub fn parse_address(address: &str, default_port: u16) -> Result<(String, u16), LinkError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(LinkError::InvalidAddress(address.to_string()));
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(LinkError::InvalidAddress(address.to_string()));
        };
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(LinkError::InvalidAddress(address.to_string())),
            },
        }
    } else if address.matches(':').count() == 1 {
        let (host, port) = address.split_once(':').unwrap_or((address, ""));
        (host, Some(port))
    } else {
        (address, None)
    };

    if host.is_empty() {
        return Err(LinkError::InvalidAddress(address.to_string()));
    }
    let port = match port {
        None => default_port,
        Some(p) => p
            .trim()
            .parse::<u16>()
            .map_err(|_| LinkError::InvalidPort(p.to_string()))?,
    };
    Ok((host.to_string(), port))
}

fn resolve_socket_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let endpoint = format!("{host}:{port}");
    let mut addrs = endpoint.to_socket_addrs()?;
    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No address resolved for {endpoint}"),
        )
    })
}

fn receive_thread_main(shared: Arc<Shared>, mut stream: TcpStream) {
    match receive_loop(&shared, &mut stream) {
        Ok(()) => debug!("Receiver: receive loop finished"),
        Err(e) if shared.is_connected() => warn!("Receiver: connection lost: {e}"),
        Err(e) => debug!("Receiver: receive loop closed: {e}"),
    }
    shared.teardown();
}

fn receive_loop(shared: &Shared, stream: &mut TcpStream) -> Result<(), LinkError> {
    loop {
        let update: UpdateEnvelope = wire::read_frame(stream)?;
        let outgoing = shared.endpoint.take_control_changes();
        trace!(
            "Receiver: update (snapshot: {}), answering with {} changes",
            update.has_snapshot(),
            outgoing.as_ref().map_or(0, Vec::len)
        );
        wire::write_frame(stream, &outgoing)?;

        if shared
            .updates
            .push(update, shared.poll_interval, || shared.is_connected())
            .is_err()
        {
            return Ok(());
        }
    }
}

fn consumer_thread_main(shared: Arc<Shared>) {
    while let Some(update) = shared
        .updates
        .pop(shared.poll_interval, || shared.is_connected())
    {
        if !shared.is_connected() {
            break;
        }
        if let Err(e) = shared.endpoint.receive_update(update) {
            warn!("Receiver: update rejected, dropping session: {e}");
            shared.teardown();
            break;
        }
        thread::yield_now();
    }
    debug!("Receiver: consumer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_without_port_uses_default() {
        let (host, port) = parse_address("example.net", 9998).expect("parse");
        assert_eq!(host, "example.net");
        assert_eq!(port, 9998);
    }

    #[test]
    fn address_with_port() {
        let (host, port) = parse_address(" 10.0.0.2:4001 ", 9998).expect("parse");
        assert_eq!(host, "10.0.0.2");
        assert_eq!(port, 4001);
    }

    #[test]
    fn ipv6_addresses() {
        assert_eq!(
            parse_address("[::1]:5000", 9998).expect("parse"),
            ("::1".to_string(), 5000)
        );
        assert_eq!(
            parse_address("[::1]", 9998).expect("parse"),
            ("::1".to_string(), 9998)
        );
        assert_eq!(
            parse_address("fe80::1", 9998).expect("parse"),
            ("fe80::1".to_string(), 9998)
        );
    }

    #[test]
    fn invalid_port_is_reported() {
        assert!(matches!(
            parse_address("localhost:99999", 9998),
            Err(LinkError::InvalidPort(p)) if p == "99999"
        ));
        assert!(matches!(
            parse_address("localhost:", 9998),
            Err(LinkError::InvalidPort(_))
        ));
    }

    #[test]
    fn invalid_addresses_are_reported() {
        assert!(matches!(parse_address("", 1), Err(LinkError::InvalidAddress(_))));
        assert!(matches!(parse_address(":80", 1), Err(LinkError::InvalidAddress(_))));
        assert!(matches!(parse_address("[::1", 1), Err(LinkError::InvalidAddress(_))));
    }

    #[test]
    fn resolve_socket_addr_accepts_numeric_host() {
        let addr = resolve_socket_addr("127.0.0.1", 5000).expect("numeric host should parse");
        assert_eq!(addr.port(), 5000);
        assert!(addr.ip().is_ipv4());
    }
}
