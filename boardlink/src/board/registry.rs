//! Board kinds available to connection nodes.
//!
//! Each board kind submits a [`BoardDescriptor`] through `inventory`; a
//! node's `boardType` is resolved against these at validation time, so an
//! unknown kind is rejected before any transport is opened.

use super::{Board, BoardInit};
use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Registration record for a board kind.
pub struct BoardDescriptor {
    /// Name matched against a node's `boardType`.
    pub name: &'static str,
    /// Transport kinds this board can run over.
    pub transports: &'static [TransportKind],
    /// Attach a board of this kind to an opened stream.
    pub create_fn: fn(BoardInit) -> Result<Board>,
}

impl std::fmt::Debug for BoardDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDescriptor")
            .field("name", &self.name)
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

inventory::collect!(BoardDescriptor);

/// Lookup over every registered [`BoardDescriptor`].
pub struct BoardRegistry;

impl BoardRegistry {
    pub fn find(&self, name: &str) -> Option<&'static BoardDescriptor> {
        inventory::iter::<BoardDescriptor>().find(|desc| desc.name == name)
    }

    /// Names of all registered board kinds, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = inventory::iter::<BoardDescriptor>()
            .map(|desc| desc.name)
            .collect();
        names.sort_unstable();
        names
    }

    /// Find the board kind for a node, checking it supports the transport.
    pub fn resolve(&self, name: &str, transport: TransportKind) -> Result<&'static BoardDescriptor> {
        let desc = self.find(name).ok_or_else(|| {
            Error::Config(format!(
                "unknown board type '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        if !desc.transports.contains(&transport) {
            return Err(Error::Config(format!(
                "board type '{}' does not support {} connections",
                name, transport
            )));
        }
        Ok(desc)
    }
}
