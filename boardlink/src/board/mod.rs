//! Board adapter.
//!
//! A [`Board`] binds one opened transport stream to a board protocol and
//! exposes the resulting [`Io`] control surface. Boards are mirrored into
//! the shared [`BoardCache`] while they are alive.

pub mod cache;
pub mod component;
pub mod firmata;
pub mod io;
pub mod registry;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use cache::{BoardCache, CacheEntry};
pub use component::{Blink, Component, ComponentKey, ComponentTimer};
pub use io::{Io, LinkHandle, PinIo, Version};
pub use registry::{BoardDescriptor, BoardRegistry};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::Stream;

/// Callback a board uses to report a lost stream.
pub type FaultSink = Arc<dyn Fn(Error) + Send + Sync>;

/// Process-unique board identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BoardId(u64);

impl BoardId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "board-{}", self.0)
    }
}

/// Identity of a connection node, as assigned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a board kind needs to attach to an opened stream.
pub struct BoardInit {
    /// Identity the board will carry, chosen by the owning connection so
    /// it can tell this board's signals from a previous one's.
    pub board: BoardId,
    pub connection: ConnectionId,
    pub stream: Stream,
    pub peer: String,
    pub cache: BoardCache,
    pub on_fault: FaultSink,
}

/// A board bound to one transport stream.
pub struct Board {
    id: BoardId,
    kind: &'static str,
    connection: ConnectionId,
    io: Io,
    link: Option<LinkHandle>,
    cache: BoardCache,
}

impl Board {
    /// Register a new board in the cache and start reading its stream.
    pub fn attach(kind: &'static str, init: BoardInit) -> Result<Self> {
        let id = init.board;
        init.cache.insert(CacheEntry {
            board: id,
            connection: init.connection.clone(),
            board_type: kind.to_string(),
        })?;

        let (io, link) = Io::attach(id, init.stream, init.peer, init.on_fault);
        debug!(board = %id, kind, connection = %init.connection, "Board attached.");

        Ok(Self {
            id,
            kind,
            connection: init.connection,
            io,
            link: Some(LinkHandle(link)),
            cache: init.cache,
        })
    }

    pub fn id(&self) -> BoardId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    /// Hand over the handle that closes this board's stream.
    ///
    /// Yields the handle once; the owning connection parks it with its
    /// other closeables.
    pub fn take_link_handle(&mut self) -> Option<LinkHandle> {
        self.link.take()
    }

    /// Release everything the board holds once its stream is closed.
    ///
    /// Prunes the board from the cache, cleans up every registered
    /// component and drops the board's transport reference. Returns the
    /// component cleanup failures, which have already been logged.
    pub fn release(&mut self) -> Vec<Error> {
        self.cache.remove(self.id);
        let failures = self.io.release_components();
        self.io.detach();
        self.link = None;
        debug!(board = %self.id, connection = %self.connection, "Board released.");
        failures
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
