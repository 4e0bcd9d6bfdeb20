//! UDP datagram bridge presented as a byte stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use super::{EventSink, OpenedTransport, TransportEvent};
use crate::error::Error;
use crate::tracing::prelude::*;

/// A UDP socket connected to one peer, read and written as a stream.
///
/// Each write is sent as one datagram; each read returns at most one
/// datagram. Datagrams larger than the read buffer are truncated, which is
/// harmless for board protocols that send short messages.
///
/// A refused or reset datagram does not end the stream: it is reported as
/// a fault and reading continues, since the board may come up later.
pub struct UdpStream {
    socket: UdpSocket,
    events: EventSink,
}

impl UdpStream {
    pub fn new(socket: UdpSocket, events: EventSink) -> Self {
        Self { socket, events }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self.socket.poll_recv(cx, buf) {
                Poll::Ready(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    trace!(error = %e, "UDP peer unreachable.");
                    (self.events)(TransportEvent::Fault(Error::Io(e)));
                }
                other => return other,
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Bind a UDP endpoint and associate it with the board at `host:port`.
///
/// UDP is connectionless: the stream is announced as soon as the socket is
/// bound, which says nothing about whether the board is reachable. Bind or
/// address resolution failures are construction failures.
pub async fn open(host: &str, port: u16, events: EventSink) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            events(TransportEvent::Failed(Error::Transport(format!(
                "UDP bind failed: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = socket.connect((host, port)).await {
        events(TransportEvent::Failed(Error::Transport(format!(
            "UDP association with {}:{} failed: {}",
            host, port, e
        ))));
        return;
    }

    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    debug!(local = %local, host, port, "UDP socket bound.");

    events(TransportEvent::Opened(OpenedTransport {
        stream: Box::new(UdpStream::new(socket, events.clone())),
        peer: format!("{}:{}", host, port),
        announce: true,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_sink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn datagrams_flow_both_ways() {
        let board = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = board.local_addr().unwrap().port();
        let (sink, mut rx) = test_sink::channel();

        open("127.0.0.1", port, sink).await;
        let mut stream = match rx.recv().await {
            Some(TransportEvent::Opened(opened)) => {
                assert!(opened.announce);
                opened.stream
            }
            other => panic!("unexpected event: {:?}", other),
        };

        stream.write_all(&[0xF9]).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = board.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xF9]);

        board.send_to(&[0xF9, 2, 5], from).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xF9, 2, 5]);
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_construction_failure() {
        let (sink, mut rx) = test_sink::channel();
        open("no-such-host.invalid", 3030, sink).await;
        assert!(matches!(rx.recv().await, Some(TransportEvent::Failed(_))));
    }
}
