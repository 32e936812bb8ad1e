//! Two-player link play over TCP.
//!
//! One side runs a [`host::HostConsole`]: the authoritative simulation on its
//! own clock. The other runs a [`remote::RemoteConsole`], which advances only
//! when the host sends it a tick. Input from either side travels to the host,
//! is applied there at a tick boundary, and is replayed by the remote at the
//! same tick.

pub mod config;
pub mod error;
pub mod host;
/// Bounded hand-off between a role and its network worker.
pub mod queue;
pub mod receiver;
pub mod remote;
pub mod status;
pub mod transmitter;
pub mod wire;

pub use config::LinkConfig;
pub use error::LinkError;
pub use host::HostConsole;
pub use remote::RemoteConsole;
pub use status::{ConnectionState, LinkEvent};
