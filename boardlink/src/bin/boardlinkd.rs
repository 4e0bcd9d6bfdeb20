use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use boardlink::api;
use boardlink::config::Config;
use boardlink::lifecycle::ConnectionEvent;
use boardlink::supervisor::Supervisor;
use boardlink::supervisor_cmd::Deployed;
use boardlink::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (supervisor, handle) = Supervisor::new();
    tracker.spawn(supervisor.run());

    for node in config.connections {
        let id = node.id.clone();
        match handle.deploy(node).await {
            Ok(Deployed { mut events, .. }) => {
                tracker.spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(ConnectionEvent::IoReady(io)) => info!(
                                connection = %id,
                                board = %io.board_id(),
                                firmware = ?io.firmware(),
                                "Board ready."
                            ),
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }
            Err(e) => error!(connection = %id, error = %e, "Deploy failed."),
        }
    }

    let listen = std::env::var("BOARDLINK_API_LISTEN").unwrap_or(config.api.listen);
    {
        let handle = handle.clone();
        let running = running.clone();
        tracker.spawn(async move {
            if let Err(e) = api::serve(&listen, handle, running).await {
                error!(error = %e, "API server failed.");
            }
        });
    }
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm =
        unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Supervisor already stopped.");
    }

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
