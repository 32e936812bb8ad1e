use std::io;

use thiserror::Error;
use twinplay_core::machine::MachineError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    #[error("transmitter already started")]
    AlreadyStarted,
    #[error("receiver already connected")]
    AlreadyConnected,
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("machine state rejected: {0}")]
    Machine(#[from] MachineError),
}
