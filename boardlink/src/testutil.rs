//! Test doubles shared across modules.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::transport::Stream;

const WAIT_LIMIT: Duration = Duration::from_secs(3);

/// Version report a fake board answers queries with: protocol 2.5.
pub const VERSION_REPLY: [u8; 3] = [0xF9, 0x02, 0x05];

/// Board end of a stream that speaks just enough of the protocol for a
/// handshake, and records everything the host writes.
pub struct FakeBoard {
    received: Arc<Mutex<Vec<u8>>>,
    notify: Arc<Notify>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl FakeBoard {
    /// In-memory stream pair with a board that answers version queries.
    pub fn pair() -> (Stream, Self) {
        let (host, board) = tokio::io::duplex(1024);
        (Box::new(host), Self::spawn(board, true))
    }

    /// In-memory stream pair with a board that never answers.
    pub fn silent_pair() -> (Stream, Self) {
        let (host, board) = tokio::io::duplex(1024);
        (Box::new(host), Self::spawn(board, false))
    }

    /// Dial a listening connection as the board, retrying until it is up.
    pub async fn connect(port: u16) -> Self {
        let dial = async {
            loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => return stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        };
        let stream = tokio::time::timeout(WAIT_LIMIT, dial)
            .await
            .expect("listener never came up");
        Self::spawn(stream, true)
    }

    /// Accept one host connection as the board.
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT_LIMIT, listener.accept())
            .await
            .expect("host never connected")
            .unwrap();
        Self::spawn(stream, true)
    }

    pub fn spawn<S>(mut stream: S, answer: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let received = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let task_received = received.clone();
        let task_notify = notify.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                tokio::select! {
                    read = stream.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        task_received.lock().extend_from_slice(&buf[..n]);
                        task_notify.notify_waiters();
                        if answer && buf[..n].contains(&0xF9) {
                            if stream.write_all(&VERSION_REPLY).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(bytes) = outbound_rx.recv() => {
                        if stream.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            received,
            notify,
            outbound,
            task,
        }
    }

    /// Everything the host has written so far.
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    /// Wait until the host has written `pattern`, panicking after a while.
    pub async fn wait_for(&self, pattern: &[u8]) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if contains(&self.received.lock(), pattern) {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(WAIT_LIMIT, wait).await.is_err() {
            panic!(
                "host never wrote {}; got {}",
                hex::encode(pattern),
                hex::encode(self.received())
            );
        }
    }

    /// Write raw bytes to the host.
    pub async fn send(&self, bytes: &[u8]) {
        self.outbound.send(bytes.to_vec()).unwrap();
        tokio::task::yield_now().await;
    }
}

impl Drop for FakeBoard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Session accepted, no session present.
pub const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// Broker end of one bus client session, speaking raw packets.
pub struct FakeBroker {
    stream: TcpStream,
}

impl FakeBroker {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT_LIMIT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self { stream }
    }

    /// Next packet from the client: fixed header byte and body.
    pub async fn read_packet(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let header = self.stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.stream.read_u8().await?;
            len |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Deliver `payload` on `topic` at QoS 0.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let len = 2 + topic.len() + payload.len();
        assert!(len < 128, "publish too large for a one-byte length");
        let mut packet = vec![0x30, len as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        self.write(&packet).await;
    }

    /// Answer the client until it closes: acknowledge subscriptions and
    /// pings, and reply to version queries on `inbound` with
    /// [`VERSION_REPLY`] on `outbound`.
    pub async fn serve_board(&mut self, inbound: &str, outbound: &str) {
        while let Ok((header, body)) = self.read_packet().await {
            match header & 0xF0 {
                0x80 => self.write(&[0x90, 0x03, body[0], body[1], 0x00]).await,
                0x30 => {
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let topic = &body[2..2 + topic_len];
                    let payload = &body[2 + topic_len..];
                    if topic == inbound.as_bytes() && payload.contains(&0xF9) {
                        self.publish(outbound, &VERSION_REPLY).await;
                    }
                }
                0xC0 => self.write(&[0xD0, 0x00]).await,
                _ => {}
            }
        }
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// A TCP port nothing is listening on.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}
