#![deny(missing_docs)]

//! Broker daemon mediating access to a single half-duplex serial device,
//! the controller of a KORUZA free-space optical link.
//!
//! The device accepts one in-flight request at a time, so the broker
//! serializes commands from any number of local clients connected over a
//! Unix socket, streams each multi-line reply back to the client that
//! asked for it, and recovers the serial port (optionally through an
//! external reset hook) when the device stops answering.

/// The command line interface.
pub mod cli;

/// Client side: connect to a running broker and issue commands.
pub mod client;

/// Relates to config files.
pub mod config;

/// Device links: the real serial port, and a mock for tests.
pub mod device;

/// The reply envelope and its end-of-message detection.
pub mod envelope;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// Code relating to setting up the server.
pub mod server;

/// The broker actor: command scheduling, reply routing, device reset.
pub(crate) mod broker;

/// The task spawned from a connected client.
pub(crate) mod connection;
