//! Supervisor command queue for external control interfaces.
//!
//! The API, the daemon and tests drive the supervisor through these
//! commands instead of touching its connections directly.

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::lifecycle::{ConnectionEvent, ConnectionHandle, ConnectionState};
use crate::status::Status;

/// Commands that can be sent to the supervisor for execution.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Start a connection, replacing any running one with the same id.
    Deploy {
        config: NodeConfig,
        response_tx: oneshot::Sender<Result<Deployed>>,
    },
    /// Tear down a connection. Responds with whether it existed.
    Remove {
        id: String,
        response_tx: oneshot::Sender<bool>,
    },
    /// Summaries of every connection, in deploy order.
    List {
        response_tx: oneshot::Sender<Vec<ConnectionSummary>>,
    },
    /// Subscribe to a running connection's events.
    Subscribe {
        id: String,
        response_tx: oneshot::Sender<Option<broadcast::Receiver<ConnectionEvent>>>,
    },
    /// Tear down every connection and stop the supervisor.
    Shutdown { response_tx: oneshot::Sender<()> },
}

/// Result of a deploy.
#[derive(Debug)]
pub struct Deployed {
    pub handle: ConnectionHandle,
    /// Subscribed before the connection started, so no event is missed.
    pub events: broadcast::Receiver<ConnectionEvent>,
    /// Whether a previous connection with this id was torn down first.
    pub replaced: bool,
}

/// One connection as reported to external interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub board_type: String,
    pub connection_type: String,
    pub state: ConnectionState,
    pub status: Status,
}
