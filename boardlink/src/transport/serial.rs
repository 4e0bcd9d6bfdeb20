//! Locally attached serial devices.

use tokio_serial::SerialPortBuilderExt;

use super::{EventSink, OpenedTransport, TransportEvent};
use crate::error::Error;
use crate::tracing::prelude::*;

/// Default baud rate for Firmata over a local serial link.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Open a serial device.
///
/// A local link has no network phase, so the opened stream is not
/// announced; the board may go straight to ready once its handshake
/// completes. A missing device or a permission problem is a construction
/// failure.
pub fn open(path: &str, baud_rate: u32, events: EventSink) {
    trace!(path, baud_rate, "Opening serial device.");

    match tokio_serial::new(path, baud_rate).open_native_async() {
        Ok(port) => {
            debug!(path, baud_rate, "Serial device open.");
            events(TransportEvent::Opened(OpenedTransport {
                stream: Box::new(port),
                peer: path.to_string(),
                announce: false,
            }));
        }
        Err(e) => {
            events(TransportEvent::Failed(Error::Serial(e)));
        }
    }
}
