//! Control surface of a live board.
//!
//! [`Io`] is the handle consumers receive with the network-ready and
//! io-ready events. It owns the board's [`Link`] (framed reader task plus
//! writer), dispatches inbound reports to subscribers, and implements
//! [`PinIo`], the command set peripheral nodes are written against.

use async_trait::async_trait;
use futures::SinkExt;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::component::{self, Component, ComponentKey};
use super::firmata::{Command, FirmataCodec, Message, PinMode};
use super::{BoardId, FaultSink};
use crate::closeable::Closeable;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::Stream;

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const I2C_READ_TIMEOUT: Duration = Duration::from_secs(1);
const SUBSCRIPTION_DEPTH: usize = 32;

/// Protocol version reported by the board during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Pin and peripheral commands available once a board is ready.
///
/// Reads are push-style: the returned receiver yields a value every time
/// the board reports one.
#[async_trait]
pub trait PinIo: Send + Sync {
    async fn pin_mode(&self, pin: u8, mode: PinMode) -> Result<()>;
    async fn digital_write(&self, pin: u8, value: u8) -> Result<()>;
    async fn analog_write(&self, pin: u8, value: u16) -> Result<()>;
    async fn servo_write(&self, pin: u8, degrees: u16) -> Result<()>;
    async fn set_sampling_interval(&self, millis: u16) -> Result<()>;
    async fn digital_read(&self, pin: u8) -> Result<mpsc::Receiver<u8>>;
    async fn analog_read(&self, channel: u8) -> Result<mpsc::Receiver<u16>>;
    async fn i2c_config(&self, delay_us: u16) -> Result<()>;
    async fn i2c_write(&self, address: u8, register: Option<u8>, data: &[u8]) -> Result<()>;
    async fn i2c_read_once(&self, address: u8, register: Option<u8>, len: u8) -> Result<Vec<u8>>;
}

type Writer = FramedWrite<WriteHalf<Stream>, FirmataCodec>;
type Reader = FramedRead<ReadHalf<Stream>, FirmataCodec>;

/// The board's end of its transport: a framed writer and a reader task.
pub struct Link {
    peer: String,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    async fn send(&self, command: Command) -> Result<()> {
        let mut writer = time::timeout(LOCK_TIMEOUT, self.writer.lock())
            .await
            .map_err(|_| Error::Command("board writer lock timeout".into()))?;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        time::timeout(WRITE_TIMEOUT, writer.send(command))
            .await
            .map_err(|_| Error::Transport("board write timeout".into()))??;
        Ok(())
    }

    /// Stop reading and shut the stream down. Safe to call repeatedly.
    async fn close(&self) -> Result<()> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => {
                debug!(peer = %self.peer, "Closing board stream.");
                writer.close().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.reader.lock().is_some()
    }
}

/// Closes a board's transport on teardown.
pub struct LinkHandle(pub(super) Arc<Link>);

#[async_trait]
impl Closeable for LinkHandle {
    fn label(&self) -> &'static str {
        "board stream"
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await
    }
}

struct IoShared {
    board: BoardId,
    link: Mutex<Option<Arc<Link>>>,
    ready: AtomicBool,
    version: watch::Sender<Option<Version>>,
    firmware: Mutex<Option<String>>,
    digital: Mutex<Vec<(u8, mpsc::Sender<u8>)>>,
    analog: Mutex<Vec<(u8, mpsc::Sender<u16>)>>,
    i2c_pending: Mutex<Vec<(u8, oneshot::Sender<Vec<u8>>)>>,
    components: Mutex<SlotMap<ComponentKey, Box<dyn Component>>>,
}

impl IoShared {
    fn dispatch(&self, message: Message) {
        match message {
            Message::Version { major, minor } => {
                debug!(board = %self.board, major, minor, "Version reported.");
                self.version.send_replace(Some(Version { major, minor }));
            }
            Message::Firmware { major, minor, name } => {
                debug!(board = %self.board, firmware = %name, major, minor, "Firmware reported.");
                *self.firmware.lock() = Some(name);
            }
            Message::DigitalPort { port, mask } => {
                self.digital.lock().retain(|(pin, tx)| {
                    if pin / 8 != port {
                        return !tx.is_closed();
                    }
                    let level = (mask >> (pin % 8)) & 1;
                    !matches!(tx.try_send(level), Err(mpsc::error::TrySendError::Closed(_)))
                });
            }
            Message::Analog { channel, value } => {
                self.analog.lock().retain(|(ch, tx)| {
                    if *ch != channel {
                        return !tx.is_closed();
                    }
                    !matches!(tx.try_send(value), Err(mpsc::error::TrySendError::Closed(_)))
                });
            }
            Message::I2cReply {
                address,
                register,
                data,
            } => {
                let mut pending = self.i2c_pending.lock();
                pending.retain(|(_, tx)| !tx.is_closed());
                match pending.iter().position(|(a, _)| *a == address) {
                    Some(idx) => {
                        let (_, tx) = pending.remove(idx);
                        let _ = tx.send(data);
                    }
                    None => {
                        debug!(address, register, "Unsolicited I2C reply.");
                    }
                }
            }
        }
    }
}

async fn read_loop(mut reader: Reader, shared: Weak<IoShared>, peer: String, on_fault: FaultSink) {
    let fault = loop {
        match reader.next().await {
            Some(Ok(message)) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.dispatch(message);
            }
            Some(Err(e)) => break Error::Io(e),
            None => break Error::Transport(format!("{} closed the connection", peer)),
        }
    };
    debug!(peer = %peer, error = %fault, "Board stream lost.");
    on_fault(fault);
}

/// Handle to a board's control surface.
#[derive(Clone)]
pub struct Io {
    shared: Arc<IoShared>,
}

impl fmt::Debug for Io {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Io")
            .field("board", &self.shared.board)
            .field("ready", &self.is_ready())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl Io {
    /// Attach to a stream and start reading from it.
    pub(super) fn attach(
        board: BoardId,
        stream: Stream,
        peer: String,
        on_fault: FaultSink,
    ) -> (Self, Arc<Link>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (version, _) = watch::channel(None);
        let shared = Arc::new(IoShared {
            board,
            link: Mutex::new(None),
            ready: AtomicBool::new(false),
            version,
            firmware: Mutex::new(None),
            digital: Mutex::new(Vec::new()),
            analog: Mutex::new(Vec::new()),
            i2c_pending: Mutex::new(Vec::new()),
            components: Mutex::new(SlotMap::with_key()),
        });

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, FirmataCodec),
            Arc::downgrade(&shared),
            peer.clone(),
            on_fault,
        ));
        let link = Arc::new(Link {
            peer,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(write_half, FirmataCodec))),
            reader: Mutex::new(Some(reader)),
        });
        *shared.link.lock() = Some(link.clone());

        (Self { shared }, link)
    }

    pub fn board_id(&self) -> BoardId {
        self.shared.board
    }

    /// Whether the protocol handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Whether the board still holds a transport.
    pub fn is_attached(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Firmware name, if the board reported one.
    pub fn firmware(&self) -> Option<String> {
        self.shared.firmware.lock().clone()
    }

    pub fn version(&self) -> Option<Version> {
        *self.shared.version.borrow()
    }

    /// Attach a peripheral helper so teardown can clean it up.
    pub fn register_component(&self, component: Box<dyn Component>) -> ComponentKey {
        let name = component.name().to_string();
        let key = self.shared.components.lock().insert(component);
        debug!(board = %self.shared.board, component = %name, "Component registered.");
        key
    }

    pub fn component_count(&self) -> usize {
        self.shared.components.lock().len()
    }

    /// Stop, cancel and detach every registered component.
    ///
    /// Each component is released even if an earlier one fails; failures
    /// are logged and returned.
    pub(super) fn release_components(&self) -> Vec<Error> {
        let drained: Vec<_> = self.shared.components.lock().drain().collect();
        let mut failures = Vec::new();
        for (_, mut component) in drained {
            let name = component.name().to_string();
            match component::release(component.as_mut()) {
                Ok(()) => debug!(board = %self.shared.board, component = %name, "Component released."),
                Err(e) => {
                    warn!(board = %self.shared.board, component = %name, error = %e, "Component cleanup failed.");
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Drop the board's reference to its transport.
    pub(super) fn detach(&self) {
        self.shared.ready.store(false, Ordering::Release);
        self.shared.link.lock().take();
    }

    fn link(&self) -> Result<Arc<Link>> {
        self.shared.link.lock().clone().ok_or(Error::NotConnected)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.link()?.send(command).await
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_attached() {
            Err(Error::NotConnected)
        } else if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Command("board is not ready".into()))
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.ensure_ready()?;
        self.send(command).await
    }

    /// Run the protocol handshake.
    ///
    /// Queries the protocol version and waits for the report; boards that
    /// announce their version on reset satisfy the wait immediately. Once
    /// the version is known the board is ready, and the sampling interval
    /// is applied on a best-effort basis.
    pub async fn handshake(&self, timeout: Duration, sampling_interval: u16) -> Result<Version> {
        let mut version_rx = self.shared.version.subscribe();
        self.send(Command::QueryVersion)
            .await
            .map_err(|e| Error::Handshake(format!("version query failed: {}", e)))?;

        let reported = match time::timeout(timeout, version_rx.wait_for(Option::is_some)).await {
            Ok(Ok(version)) => *version,
            Ok(Err(_)) => None,
            Err(_) => {
                return Err(Error::Handshake(format!(
                    "no version report within {} ms",
                    timeout.as_millis()
                )))
            }
        };
        let Some(version) = reported else {
            return Err(Error::Handshake("board went away during handshake".into()));
        };

        self.shared.ready.store(true, Ordering::Release);
        info!(board = %self.shared.board, version = %version, "Board ready.");

        if let Err(e) = self.send(Command::QueryFirmware).await {
            debug!(board = %self.shared.board, error = %e, "Firmware query failed.");
        }
        if let Err(e) = self.set_sampling_interval(sampling_interval).await {
            warn!(board = %self.shared.board, error = %e, "Could not set sampling interval.");
        }
        Ok(version)
    }
}

#[async_trait]
impl PinIo for Io {
    async fn pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.command(Command::SetPinMode { pin, mode }).await
    }

    async fn digital_write(&self, pin: u8, value: u8) -> Result<()> {
        self.command(Command::DigitalWrite { pin, value }).await
    }

    async fn analog_write(&self, pin: u8, value: u16) -> Result<()> {
        self.command(Command::AnalogWrite { pin, value }).await
    }

    async fn servo_write(&self, pin: u8, degrees: u16) -> Result<()> {
        self.command(Command::AnalogWrite {
            pin,
            value: degrees,
        })
        .await
    }

    async fn set_sampling_interval(&self, millis: u16) -> Result<()> {
        self.command(Command::SamplingInterval { millis }).await
    }

    async fn digital_read(&self, pin: u8) -> Result<mpsc::Receiver<u8>> {
        self.ensure_ready()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.shared.digital.lock().push((pin, tx));
        self.send(Command::ReportDigital {
            port: pin / 8,
            enable: true,
        })
        .await?;
        Ok(rx)
    }

    async fn analog_read(&self, channel: u8) -> Result<mpsc::Receiver<u16>> {
        self.ensure_ready()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.shared.analog.lock().push((channel, tx));
        self.send(Command::ReportAnalog {
            channel,
            enable: true,
        })
        .await?;
        Ok(rx)
    }

    async fn i2c_config(&self, delay_us: u16) -> Result<()> {
        self.command(Command::I2cConfig { delay_us }).await
    }

    async fn i2c_write(&self, address: u8, register: Option<u8>, data: &[u8]) -> Result<()> {
        self.command(Command::I2cWrite {
            address,
            register,
            data: data.to_vec(),
        })
        .await
    }

    async fn i2c_read_once(&self, address: u8, register: Option<u8>, len: u8) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        let (tx, rx) = oneshot::channel();
        self.shared.i2c_pending.lock().push((address, tx));
        self.send(Command::I2cReadOnce {
            address,
            register,
            len,
        })
        .await?;
        match time::timeout(I2C_READ_TIMEOUT, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Command(format!(
                "no I2C reply from 0x{:02x} within {} ms",
                address,
                I2C_READ_TIMEOUT.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBoard;

    fn attach(stream: Stream) -> (Io, Arc<Link>, mpsc::UnboundedReceiver<Error>) {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let on_fault: FaultSink = Arc::new(move |e| {
            let _ = fault_tx.send(e);
        });
        let (io, link) = Io::attach(BoardId::next(), stream, "test".into(), on_fault);
        (io, link, fault_rx)
    }

    #[tokio::test]
    async fn commands_wait_for_handshake() {
        let (host, fake) = FakeBoard::pair();
        let (io, _link, _faults) = attach(host);

        assert!(matches!(
            io.digital_write(13, 1).await,
            Err(Error::Command(_))
        ));

        let version = io.handshake(Duration::from_secs(1), 100).await.unwrap();
        assert_eq!(version, Version { major: 2, minor: 5 });
        io.digital_write(13, 1).await.unwrap();
        fake.wait_for(&[0xF5, 13, 1]).await;
        fake.wait_for(&[0xF0, 0x7A, 100, 0, 0xF7]).await;
    }

    #[tokio::test]
    async fn silent_board_fails_handshake() {
        let (host, _fake) = FakeBoard::silent_pair();
        let (io, _link, _faults) = attach(host);

        let err = io.handshake(Duration::from_millis(50), 500).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(!io.is_ready());
    }

    #[tokio::test]
    async fn digital_reports_reach_subscribers() {
        let (host, fake) = FakeBoard::pair();
        let (io, _link, _faults) = attach(host);
        io.handshake(Duration::from_secs(1), 100).await.unwrap();

        let mut pin10 = io.digital_read(10).await.unwrap();
        fake.wait_for(&[0xD1, 1]).await;
        fake.send(&[0x91, 0x04, 0x00]).await;
        assert_eq!(pin10.recv().await, Some(1));
    }

    #[tokio::test]
    async fn i2c_read_once_resolves_on_reply() {
        let (host, fake) = FakeBoard::pair();
        let (io, _link, _faults) = attach(host);
        io.handshake(Duration::from_secs(1), 100).await.unwrap();

        let reader = io.clone();
        let read = tokio::spawn(async move { reader.i2c_read_once(0x48, Some(1), 1).await });
        fake.wait_for(&[0xF0, 0x76, 0x48, 0x08]).await;
        fake.send(&[0xF0, 0x77, 0x48, 0x00, 0x01, 0x00, 0x2A, 0x00, 0xF7])
            .await;
        assert_eq!(read.await.unwrap().unwrap(), vec![0x2A]);
    }

    #[tokio::test]
    async fn peer_close_is_reported_once() {
        let (host, fake) = FakeBoard::pair();
        let (_io, _link, mut faults) = attach(host);

        drop(fake);
        assert!(matches!(faults.recv().await, Some(Error::Transport(_))));
        assert!(faults.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_link_rejects_commands() {
        let (host, _fake) = FakeBoard::pair();
        let (io, link, _faults) = attach(host);
        io.handshake(Duration::from_secs(1), 100).await.unwrap();

        let mut handle = LinkHandle(link.clone());
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(!link.is_open());
        assert!(matches!(io.digital_write(1, 1).await, Err(Error::NotConnected)));

        io.detach();
        assert!(!io.is_attached());
        assert!(!io.is_ready());
    }
}
