//! Physical transport layer for board connections.
//!
//! This module brings up the byte stream a board protocol runs over. Five
//! transport kinds are supported: a local serial device, a TCP client, a
//! TCP listener, a UDP bridge and a serial link tunneled over a message bus.
//! Whatever the kind, the result is reported through the same small set of
//! [`TransportEvent`]s: handles the connection now owns, an opened duplex
//! stream, a construction failure or a later network fault.

pub mod bridge;
pub mod serial;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::closeable::{CloseSlot, Closeable};
use crate::error::Error;

/// Byte stream a board protocol can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased duplex stream.
pub type Stream = Box<dyn AsyncStream>;

/// Transport kind tag as named in node configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum TransportKind {
    #[strum(to_string = "local", serialize = "serial")]
    Local,
    #[strum(serialize = "tcp")]
    TcpClient,
    #[strum(serialize = "tcplisten")]
    TcpListener,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "mqtt")]
    BridgedSerial,
}

/// Credentials for a message-bus connection.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully validated transport configuration.
///
/// Immutable once a connection is created; a change means a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Local {
        path: String,
        baud_rate: u32,
    },
    TcpClient {
        host: String,
        port: u16,
    },
    TcpListener {
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
    BridgedSerial {
        server_url: String,
        credentials: Option<Credentials>,
        publish_topic: String,
        subscribe_topic: String,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Local { .. } => TransportKind::Local,
            TransportConfig::TcpClient { .. } => TransportKind::TcpClient,
            TransportConfig::TcpListener { .. } => TransportKind::TcpListener,
            TransportConfig::Udp { .. } => TransportKind::Udp,
            TransportConfig::BridgedSerial { .. } => TransportKind::BridgedSerial,
        }
    }
}

/// A stream that is open and ready for a board to attach to.
pub struct OpenedTransport {
    pub stream: Stream,
    /// Human-readable peer description for logs.
    pub peer: String,
    /// Whether this transport has a network phase of its own, i.e. whether
    /// opening it should be announced as network-ready before the board
    /// handshake.
    pub announce: bool,
}

impl fmt::Debug for OpenedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedTransport")
            .field("peer", &self.peer)
            .field("announce", &self.announce)
            .finish_non_exhaustive()
    }
}

/// Everything a transport reports back to its owning connection.
pub enum TransportEvent {
    /// A handle the connection must close on teardown.
    Acquired(CloseSlot, Box<dyn Closeable>),
    /// A stream is open. Listeners report one per accepted peer.
    Opened(OpenedTransport),
    /// Construction failed; no stream will follow.
    Failed(Error),
    /// A socket-level fault after construction.
    Fault(Error),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Acquired(slot, handle) => {
                write!(f, "Acquired({}, {})", slot, handle.label())
            }
            TransportEvent::Opened(opened) => write!(f, "Opened({:?})", opened),
            TransportEvent::Failed(e) => write!(f, "Failed({})", e),
            TransportEvent::Fault(e) => write!(f, "Fault({})", e),
        }
    }
}

/// Callback a transport uses to report [`TransportEvent`]s.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Bring up a transport, reporting progress through `events`.
///
/// Returns once the transport is either open, listening, or has failed;
/// background work (accept loops, bus event loops) continues in tasks whose
/// handles are reported as [`TransportEvent::Acquired`].
pub async fn open(config: TransportConfig, events: EventSink) {
    match config {
        TransportConfig::Local { path, baud_rate } => serial::open(&path, baud_rate, events),
        TransportConfig::TcpClient { host, port } => tcp::connect(&host, port, events).await,
        TransportConfig::TcpListener { port } => tcp::listen(port, events).await,
        TransportConfig::Udp { host, port } => udp::open(&host, port, events).await,
        TransportConfig::BridgedSerial {
            server_url,
            credentials,
            publish_topic,
            subscribe_topic,
        } => bridge::open(
            bridge::BridgeOptions {
                server_url,
                credentials,
                publish_topic,
                subscribe_topic,
            },
            events,
        ),
    }
}
