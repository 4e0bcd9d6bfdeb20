//! TCP client and listener transports.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::{EventSink, OpenedTransport, TransportEvent};
use crate::closeable::{CloseSlot, Closeable};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Connect to a board listening on `host:port`.
///
/// The board protocol expects an explicit open signal distinct from the
/// socket connect, so a successful connect is reported as an announced
/// [`OpenedTransport`]. Connect failures are socket faults rather than
/// construction failures.
pub async fn connect(host: &str, port: u16, events: EventSink) {
    trace!(host, port, "Connecting.");

    match TcpStream::connect((host, port)).await {
        Ok(stream) => {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| format!("{}:{}", host, port));
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Could not disable Nagle.");
            }
            debug!(peer = %peer, "Connected.");
            events(TransportEvent::Opened(OpenedTransport {
                stream: Box::new(stream),
                peer,
                announce: true,
            }));
        }
        Err(e) => {
            events(TransportEvent::Fault(Error::Transport(format!(
                "connect to {}:{} failed: {}",
                host, port, e
            ))));
        }
    }
}

/// Listen for a board connecting in on `port`.
///
/// Binding failure is a construction failure. Every accepted peer is
/// reported as an announced [`OpenedTransport`]; deciding which peers get a
/// board is up to the owning connection. Accept errors are faults and do not
/// stop the listener.
pub async fn listen(port: u16, events: EventSink) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            events(TransportEvent::Failed(Error::Transport(format!(
                "bind to port {} failed: {}",
                port, e
            ))));
            return;
        }
    };

    let local_addr = listener.local_addr().ok();
    info!(port, "Listening for board connections.");

    let accept_events = events.clone();
    let accept_task = tokio::spawn(accept_loop(listener, accept_events));
    events(TransportEvent::Acquired(
        CloseSlot::Listener,
        Box::new(ListenerHandle {
            local_addr,
            accept_task: Some(accept_task),
        }),
    ));
}

async fn accept_loop(listener: TcpListener, events: EventSink) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(peer = %addr, "Board connected.");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %e, "Could not disable Nagle.");
                }
                events(TransportEvent::Opened(OpenedTransport {
                    stream: Box::new(stream),
                    peer: addr.to_string(),
                    announce: true,
                }));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed.");
                events(TransportEvent::Fault(Error::Io(e)));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Listening server owned by a connection.
///
/// Closing stops the accept loop, which drops and thereby closes the
/// listening socket. Peers already accepted are owned separately.
pub struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Closeable for ListenerHandle {
    fn label(&self) -> &'static str {
        "tcp listener"
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            // Wait for the socket to actually be released.
            let _ = task.await;
            debug!(addr = ?self.local_addr, "Listener closed.");
        }
        Ok(())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_sink;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    #[tokio::test]
    async fn refused_connect_is_a_fault() {
        let (sink, mut rx) = test_sink::channel();
        connect("127.0.0.1", free_port(), sink).await;

        assert!(matches!(rx.recv().await, Some(TransportEvent::Fault(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_is_announced() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (sink, mut rx) = test_sink::channel();

        connect("127.0.0.1", port, sink).await;

        match rx.recv().await {
            Some(TransportEvent::Opened(opened)) => assert!(opened.announce),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn listener_reports_handle_then_peers() {
        let port = free_port();
        let (sink, mut rx) = test_sink::channel();

        listen(port, sink).await;
        let mut handle = match rx.recv().await {
            Some(TransportEvent::Acquired(CloseSlot::Listener, handle)) => handle,
            other => panic!("unexpected event: {:?}", other),
        };

        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Opened(_))));

        handle.close().await.unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_construction_failure() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (sink, mut rx) = test_sink::channel();

        listen(port, sink).await;

        assert!(matches!(rx.recv().await, Some(TransportEvent::Failed(_))));
    }
}
