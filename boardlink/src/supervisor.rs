//! Top-level owner of every connection.
//!
//! The supervisor holds the shared [`BoardCache`] and one
//! [`ConnectionHandle`] per deployed node, keyed by node id. Deploying a
//! node that is already running tears the old instance down first, which
//! is how a host redeploy is expressed. External interfaces talk to it
//! through [`SupervisorCommand`]s, usually via a [`SupervisorHandle`].

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::board::{BoardCache, ConnectionId};
use crate::config::{NodeConfig, DEFAULT_BOARD_TYPE};
use crate::error::{Error, Result};
use crate::lifecycle::{Connection, ConnectionEvent, ConnectionHandle, ConnectionState};
use crate::status;
use crate::supervisor_cmd::{ConnectionSummary, Deployed, SupervisorCommand};
use crate::tracing::prelude::*;

const COMMAND_CAPACITY: usize = 32;

struct Deployment {
    config: NodeConfig,
    handle: ConnectionHandle,
}

/// Owns the board cache and every running connection.
pub struct Supervisor {
    cache: BoardCache,
    deployments: Vec<Deployment>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
}

impl Supervisor {
    /// Create a supervisor and the handle used to command it.
    pub fn new() -> (Self, SupervisorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let supervisor = Self {
            cache: BoardCache::new(),
            deployments: Vec::new(),
            cmd_rx,
        };
        (supervisor, SupervisorHandle { cmd_tx })
    }

    pub fn cache(&self) -> BoardCache {
        self.cache.clone()
    }

    /// Run the command loop until shutdown or until every handle is gone.
    pub async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            if !self.handle_command(cmd).await {
                return;
            }
        }
        self.shutdown_all().await;
    }

    /// Returns false once the supervisor should stop.
    async fn handle_command(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Deploy {
                config,
                response_tx,
            } => {
                let result = self.deploy(config).await;
                // Send response back (ignore if receiver dropped)
                let _ = response_tx.send(result);
            }
            SupervisorCommand::Remove { id, response_tx } => {
                let removed = self.remove(&id).await;
                let _ = response_tx.send(removed);
            }
            SupervisorCommand::List { response_tx } => {
                let _ = response_tx.send(self.list());
            }
            SupervisorCommand::Subscribe { id, response_tx } => {
                let events = self.find(&id).map(|d| d.handle.subscribe());
                let _ = response_tx.send(events);
            }
            SupervisorCommand::Shutdown { response_tx } => {
                self.shutdown_all().await;
                let _ = response_tx.send(());
                return false;
            }
        }
        true
    }

    fn find(&self, id: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.config.id == id)
    }

    async fn deploy(&mut self, config: NodeConfig) -> Result<Deployed> {
        if config.id.is_empty() {
            return Err(Error::Config("connection without an 'id'".into()));
        }

        let replaced = self.remove(&config.id).await;
        if replaced {
            info!(connection = %config.id, "Redeploying connection.");
        }

        let connection = Connection::new(config.clone(), self.cache.clone());
        let events = connection.subscribe();
        let handle = connection.start();
        tokio::spawn(log_transitions(handle.id().clone(), handle.watch_state()));

        self.deployments.push(Deployment {
            config,
            handle: handle.clone(),
        });
        Ok(Deployed {
            handle,
            events,
            replaced,
        })
    }

    async fn remove(&mut self, id: &str) -> bool {
        let Some(idx) = self.deployments.iter().position(|d| d.config.id == id) else {
            return false;
        };
        let deployment = self.deployments.remove(idx);
        debug!(connection = %id, "Removing connection.");
        deployment.handle.teardown().await;
        true
    }

    fn list(&self) -> Vec<ConnectionSummary> {
        self.deployments
            .iter()
            .map(|d| {
                let state = d.handle.state();
                ConnectionSummary {
                    id: d.config.id.clone(),
                    name: d.config.name.clone(),
                    board_type: d
                        .config
                        .board_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_BOARD_TYPE.to_string()),
                    connection_type: d
                        .config
                        .connection_type
                        .clone()
                        .unwrap_or_else(|| "local".to_string()),
                    state,
                    status: status::project(state),
                }
            })
            .collect()
    }

    /// Tear down every connection, most recently deployed first.
    pub async fn shutdown_all(&mut self) {
        while let Some(deployment) = self.deployments.pop() {
            debug!(connection = %deployment.config.id, "Shutting down connection");
            deployment.handle.teardown().await;
        }
        debug!(cached = self.cache.len(), "All connections shut down.");
    }
}

/// Log each status change of a connection until it closes.
async fn log_transitions(id: ConnectionId, mut state: watch::Receiver<ConnectionState>) {
    loop {
        let current = *state.borrow_and_update();
        let status = status::project(current);
        info!(
            connection = %id,
            state = %current,
            fill = %status.fill,
            shape = %status.shape,
            text = status.text,
            "Status."
        );
        if current == ConnectionState::Closed || state.changed().await.is_err() {
            break;
        }
    }
}

/// Cloneable client for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Command("supervisor is not running".into()))?;
        response_rx
            .await
            .map_err(|_| Error::Command("supervisor dropped the request".into()))
    }

    pub async fn deploy(&self, config: NodeConfig) -> Result<Deployed> {
        self.request(|response_tx| SupervisorCommand::Deploy {
            config,
            response_tx,
        })
        .await?
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|response_tx| SupervisorCommand::Remove { id, response_tx })
            .await
    }

    pub async fn list(&self) -> Result<Vec<ConnectionSummary>> {
        self.request(|response_tx| SupervisorCommand::List { response_tx })
            .await
    }

    pub async fn subscribe(&self, id: &str) -> Result<Option<broadcast::Receiver<ConnectionEvent>>> {
        let id = id.to_string();
        self.request(|response_tx| SupervisorCommand::Subscribe { id, response_tx })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response_tx| SupervisorCommand::Shutdown { response_tx })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::next_event;
    use crate::testutil::FakeBoard;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    fn node(value: serde_json::Value) -> NodeConfig {
        serde_json::from_value(value).unwrap()
    }

    fn spawn() -> (SupervisorHandle, BoardCache) {
        let (supervisor, handle) = Supervisor::new();
        let cache = supervisor.cache();
        tokio::spawn(supervisor.run());
        (handle, cache)
    }

    #[tokio::test]
    async fn redeploy_replaces_the_running_connection() {
        let (supervisor, cache) = spawn();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = node(json!({"id": "n1", "connectionType": "tcp", "tcpHost": "127.0.0.1", "tcpPort": port}));

        let mut first = supervisor.deploy(config.clone()).await.unwrap();
        assert!(!first.replaced);
        let _fake1 = FakeBoard::accept(&listener).await;
        next_event(&mut first.events, WAIT).await;
        assert!(matches!(
            next_event(&mut first.events, WAIT).await,
            Some(ConnectionEvent::IoReady(_))
        ));

        let mut second = supervisor.deploy(config).await.unwrap();
        assert!(second.replaced);
        assert_eq!(first.handle.state(), ConnectionState::Closed);
        let _fake2 = FakeBoard::accept(&listener).await;
        next_event(&mut second.events, WAIT).await;
        assert!(matches!(
            next_event(&mut second.events, WAIT).await,
            Some(ConnectionEvent::IoReady(_))
        ));
        assert_eq!(cache.len(), 1);

        let list = supervisor.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, ConnectionState::IoReady);
        assert_eq!(list[0].status.text, "connected");

        supervisor.shutdown().await.unwrap();
        assert!(cache.is_empty());
        assert!(supervisor.list().await.is_err());
    }

    #[tokio::test]
    async fn configuration_failure_reaches_the_deployer() {
        let (supervisor, _cache) = spawn();
        let mut deployed = supervisor
            .deploy(node(json!({"id": "n1", "connectionType": "carrier-pigeon"})))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut deployed.events, WAIT).await,
            Some(ConnectionEvent::IoError(_))
        ));
        assert!(supervisor.remove("n1").await.unwrap());
        assert!(!supervisor.remove("n1").await.unwrap());
        assert!(supervisor.subscribe("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deploy_requires_an_id() {
        let (supervisor, _cache) = spawn();
        assert!(matches!(
            supervisor.deploy(NodeConfig::default()).await,
            Err(Error::Config(_))
        ));
    }
}
