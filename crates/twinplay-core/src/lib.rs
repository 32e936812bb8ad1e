//! Clock-driven console emulation core.
//!
//! This crate contains the platform-agnostic pieces shared by every role a
//! console can play (standalone, networked host, networked remote): the clock
//! contract, the control routing socket and the contract an emulated machine
//! must fulfil. Networking lives in `twinplay-link`; frontends drive the core
//! through [`console::Console`].

/// Periodic pulse generator driving one clock-driven target.
pub mod clock;

/// Console-level control semantics on top of a [`machine::Machine`].
pub mod console;

/// Control identifiers, control changes and the routing socket.
pub mod controls;

/// Small deterministic machine used by the CLI and tests.
pub mod demo;

/// Contract of the emulated machine and its save-state collaborators.
pub mod machine;

/// Single-player console with its own clock.
pub mod standalone;
