use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    const fn to_raw(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Listening => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Disconnected => 4,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Listening,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Disconnected,
            _ => ConnectionState::Idle,
        }
    }
}

/// Connection state readable from any thread.
#[derive(Debug, Default)]
pub struct SharedConnectionState(AtomicU8);

impl SharedConnectionState {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.to_raw(), Ordering::Release);
    }
}

/// Connection status notifications for the frontend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Listening { port: u16 },
    PeerConnected { addr: SocketAddr },
    PeerDisconnected,
    Connected { addr: SocketAddr },
    Disconnected,
    Error(String),
}
