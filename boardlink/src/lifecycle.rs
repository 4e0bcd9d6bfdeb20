//! Connection lifecycle manager.
//!
//! Each connection node runs one actor task that owns the node's transport
//! handles and board. Everything that can happen to a connection (the
//! transport opening or failing, the board's stream dropping, the handshake
//! finishing, a teardown request) arrives as a [`Signal`] on a single queue,
//! so transitions are applied one at a time in arrival order.
//!
//! Consumers see the connection through [`ConnectionEvent`]s on a broadcast
//! channel and through the current [`ConnectionState`] on a watch channel.
//!
//! ```text
//! Idle -> Connecting -> [NetworkReady] -> IoReady -> Closed
//!                 \           \            \
//!                  +-----------+------------+--> NetworkError / IoError (advisory, repeatable)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::board::{Board, BoardCache, BoardId, BoardInit, ConnectionId, FaultSink, Io, Version};
use crate::closeable::{CloseSlot, Closeable, OwnedHandles, CLOSE_TIMEOUT};
use crate::config::{NodeConfig, ValidatedConfig};
use crate::error::{Error, Result};
use crate::status::{self, Status};
use crate::tracing::prelude::*;
use crate::transport::{self, EventSink, OpenedTransport, TransportEvent, TransportKind};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    NetworkReady,
    IoReady,
    NetworkError,
    IoError,
    Closed,
}

/// What consumers of a connection are told.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport is open; the board handshake has not finished.
    NetworkReady(Io),
    /// A socket-level fault. Advisory; the connection stays up.
    NetworkError(Arc<Error>),
    /// The board is ready for commands. Sent at most once.
    IoReady(Io),
    /// Configuration, construction or handshake failure.
    IoError(Arc<Error>),
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::NetworkReady(_) => "networkReady",
            ConnectionEvent::NetworkError(_) => "networkError",
            ConnectionEvent::IoReady(_) => "ioReady",
            ConnectionEvent::IoError(_) => "ioError",
        }
    }
}

/// Inbound queue entries for a connection actor.
enum Signal {
    Transport(TransportEvent),
    /// The board's stream failed or was closed by the peer.
    BoardFault(BoardId, Error),
    Handshake(BoardId, Result<Version>),
    Teardown(oneshot::Sender<()>),
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Transport(event) => write!(f, "Transport({:?})", event),
            Signal::BoardFault(board, e) => write!(f, "BoardFault({}, {})", board, e),
            Signal::Handshake(board, Ok(v)) => write!(f, "Handshake({}, ok {})", board, v),
            Signal::Handshake(board, Err(e)) => write!(f, "Handshake({}, err {})", board, e),
            Signal::Teardown(_) => f.write_str("Teardown"),
        }
    }
}

/// A connection that has been configured but not started.
///
/// Subscribe before calling [`Connection::start`] to be sure of seeing
/// every event, including an immediate configuration failure.
pub struct Connection {
    config: NodeConfig,
    cache: BoardCache,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    pub fn new(config: NodeConfig, cache: BoardCache) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            cache,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Spawn the connection actor and begin connecting.
    pub fn start(self) -> ConnectionHandle {
        let id = ConnectionId::new(self.config.id.clone());
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let actor = Actor {
            id: id.clone(),
            config: self.config,
            cache: self.cache,
            events: self.events.clone(),
            state: state_tx,
            signals: signals_tx.clone(),
            validated: None,
            handles: OwnedHandles::new(),
            board: None,
            tasks: Vec::new(),
            handshake: None,
            ready_sent: false,
        };
        tokio::spawn(actor.run(signals_rx));

        ConnectionHandle {
            id,
            signals: signals_tx,
            events: self.events,
            state: state_rx,
        }
    }
}

/// Handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    signals: mpsc::UnboundedSender<Signal>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Current status tuple, recomputed from the live state.
    pub fn status(&self) -> Status {
        status::project(self.state())
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Tear the connection down and wait for it to finish.
    ///
    /// Safe to call any number of times from any state; once the
    /// connection is closed this returns immediately.
    pub async fn teardown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.signals.send(Signal::Teardown(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

struct Actor {
    id: ConnectionId,
    config: NodeConfig,
    cache: BoardCache,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    signals: mpsc::UnboundedSender<Signal>,
    validated: Option<ValidatedConfig>,
    handles: OwnedHandles,
    board: Option<Board>,
    tasks: Vec<JoinHandle<()>>,
    handshake: Option<JoinHandle<()>>,
    ready_sent: bool,
}

impl Actor {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        self.set_state(ConnectionState::Connecting);
        match self.config.validate() {
            Ok(validated) => self.open(validated),
            Err(e) => self.io_error(e),
        }

        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::Teardown(done) => {
                    self.teardown().await;
                    let _ = done.send(());
                    break;
                }
                Signal::Transport(event) => self.on_transport(event).await,
                Signal::BoardFault(board, e) => self.on_board_fault(board, e).await,
                Signal::Handshake(board, result) => self.on_handshake(board, result),
            }
        }

        // Anything still queued arrived after teardown began.
        signals.close();
        while let Ok(signal) = signals.try_recv() {
            match signal {
                Signal::Teardown(done) => {
                    let _ = done.send(());
                }
                Signal::Transport(TransportEvent::Acquired(slot, mut handle)) => {
                    debug!(connection = %self.id, slot = %slot, handle = handle.label(), "Closing handle acquired after teardown.");
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, handle.close()).await;
                }
                late => {
                    debug!(connection = %self.id, signal = ?late, "Dropping signal after teardown.");
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(connection = %self.id, from = %previous, to = %state, "State changed.");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        debug!(connection = %self.id, event = event.name(), "Emitting.");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn io_error(&self, error: Error) {
        warn!(connection = %self.id, class = %error.class(), error = %error, "Connection error.");
        self.set_state(ConnectionState::IoError);
        self.emit(ConnectionEvent::IoError(Arc::new(error)));
    }

    fn network_error(&self, error: Error) {
        warn!(connection = %self.id, error = %error, "Network error.");
        self.set_state(ConnectionState::NetworkError);
        self.emit(ConnectionEvent::NetworkError(Arc::new(error)));
    }

    fn open(&mut self, validated: ValidatedConfig) {
        info!(
            connection = %self.id,
            board = validated.board.name,
            transport = %validated.transport.kind(),
            "Opening connection."
        );
        let signals = self.signals.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = signals.send(Signal::Transport(event));
        });
        self.tasks
            .push(tokio::spawn(transport::open(validated.transport.clone(), sink)));
        self.validated = Some(validated);
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Acquired(slot, handle) => self.own(slot, handle).await,
            TransportEvent::Opened(opened) => self.attach(opened).await,
            TransportEvent::Failed(e) => self.io_error(e),
            TransportEvent::Fault(e) => self.network_error(e),
        }
    }

    async fn own(&mut self, slot: CloseSlot, handle: Box<dyn Closeable>) {
        if let Some(mut displaced) = self.handles.put(slot, handle) {
            warn!(connection = %self.id, slot = %slot, "Replacing owned handle.");
            if let Err(e) = displaced.close().await {
                warn!(connection = %self.id, slot = %slot, error = %e, "Failed to close replaced handle.");
            }
        }
    }

    async fn attach(&mut self, opened: OpenedTransport) {
        if let Some(board) = &self.board {
            warn!(
                connection = %self.id,
                board = %board.id(),
                peer = %opened.peer,
                "Connection already has a board, rejecting peer."
            );
            return;
        }
        let Some(validated) = &self.validated else {
            return;
        };
        let handshake_timeout = validated.handshake_timeout;
        let sampling_interval = validated.sampling_interval;

        let board_id = BoardId::next();
        let signals = self.signals.clone();
        let on_fault: FaultSink = Arc::new(move |e| {
            let _ = signals.send(Signal::BoardFault(board_id, e));
        });
        let init = BoardInit {
            board: board_id,
            connection: self.id.clone(),
            stream: opened.stream,
            peer: opened.peer.clone(),
            cache: self.cache.clone(),
            on_fault,
        };
        let mut board = match (validated.board.create_fn)(init) {
            Ok(board) => board,
            Err(e) => {
                self.io_error(e);
                return;
            }
        };
        if let Some(link) = board.take_link_handle() {
            self.own(CloseSlot::Transport, Box::new(link)).await;
        }

        let io = board.io().clone();
        info!(connection = %self.id, board = %board.id(), peer = %opened.peer, "Transport open.");
        self.board = Some(board);

        if opened.announce {
            self.set_state(ConnectionState::NetworkReady);
            self.emit(ConnectionEvent::NetworkReady(io.clone()));
        }

        let signals = self.signals.clone();
        let handshake = tokio::spawn(async move {
            let result = io.handshake(handshake_timeout, sampling_interval).await;
            let _ = signals.send(Signal::Handshake(board_id, result));
        });
        if let Some(previous) = self.handshake.replace(handshake) {
            previous.abort();
        }
    }

    fn is_current(&self, board: BoardId) -> bool {
        self.board.as_ref().map(Board::id) == Some(board)
    }

    fn on_handshake(&mut self, board_id: BoardId, result: Result<Version>) {
        if !self.is_current(board_id) {
            debug!(connection = %self.id, board = %board_id, "Ignoring handshake of a released board.");
            return;
        }
        match result {
            Ok(version) => {
                let Some(board) = &self.board else {
                    return;
                };
                if self.ready_sent {
                    return;
                }
                self.ready_sent = true;
                info!(connection = %self.id, board = %board.id(), version = %version, "Board ready.");
                let io = board.io().clone();
                self.set_state(ConnectionState::IoReady);
                self.emit(ConnectionEvent::IoReady(io));
            }
            Err(e) => self.io_error(e),
        }
    }

    async fn on_board_fault(&mut self, board: BoardId, error: Error) {
        if !self.is_current(board) {
            debug!(connection = %self.id, board = %board, error = %error, "Ignoring fault of a released board.");
            return;
        }
        self.network_error(error);
        if self.accepts_peers() {
            self.release_board().await;
        }
    }

    /// Whether new peers keep arriving on this connection's transport.
    fn accepts_peers(&self) -> bool {
        self.validated
            .as_ref()
            .is_some_and(|v| v.transport.kind() == TransportKind::TcpListener)
    }

    /// Drop a board whose peer is gone so the next accepted peer can attach.
    ///
    /// Same steps as teardown, limited to the board and its stream; the
    /// listener stays open.
    async fn release_board(&mut self) {
        if let Some(task) = self.handshake.take() {
            task.abort();
        }
        let _ = self.handles.close(CloseSlot::Transport).await;
        if let Some(mut board) = self.board.take() {
            let component_failures = board.release().len();
            info!(
                connection = %self.id,
                board = %board.id(),
                component_failures,
                "Peer gone, board released; waiting for the next peer."
            );
        }
        self.ready_sent = false;
    }

    /// Release everything the connection owns.
    ///
    /// Every step runs regardless of earlier failures. Owned handles close
    /// first (listener, transport, bus), then the board is pruned from the
    /// cache and its components are cleaned up.
    async fn teardown(&mut self) {
        info!(connection = %self.id, state = %*self.state.borrow(), "Tearing down connection.");
        for task in self.tasks.drain(..).chain(self.handshake.take()) {
            task.abort();
        }

        let close_failures = self.handles.close_all().await;

        let mut component_failures = 0;
        if let Some(mut board) = self.board.take() {
            component_failures = board.release().len();
        }

        self.set_state(ConnectionState::Closed);
        debug!(
            connection = %self.id,
            close_failures = close_failures.len(),
            component_failures,
            "Teardown complete."
        );
    }
}

/// Wait for the next event, giving up after `limit`.
pub async fn next_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    limit: Duration,
) -> Option<ConnectionEvent> {
    loop {
        match tokio::time::timeout(limit, events.recv()).await {
            Ok(Ok(event)) => return Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(skipped, "Event subscriber lagged.");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}
