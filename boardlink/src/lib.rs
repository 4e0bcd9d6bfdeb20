//! Board connection lifecycle management for flow-based automation hosts.
//!
//! A configured connection opens a transport (local serial, TCP client or
//! listener, UDP, or serial bridged over a message bus), attaches a board
//! adapter speaking Firmata, waits for the board to answer its handshake,
//! and reports `networkReady`, `networkError`, `ioReady` and `ioError` to
//! whatever consumes it. Teardown releases every owned handle and removes
//! the board from the process-wide cache.

pub mod api;
pub mod board;
pub mod closeable;
pub mod config;
pub mod error;
pub mod gpio;
pub mod lifecycle;
pub mod ports;
pub mod status;
pub mod supervisor;
pub mod supervisor_cmd;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod testutil;
