//! Serial link tunneled over a message bus.
//!
//! The board publishes its serial output to one topic and listens for input
//! on another. This module connects to the broker, wraps the two topics as
//! an in-memory duplex stream, and hands the board side of that stream to
//! the owning connection once the broker acknowledges the session.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Credentials, EventSink, OpenedTransport, TransportEvent};
use crate::closeable::{CloseSlot, Closeable};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const DEFAULT_BROKER_PORT: u16 = 1883;
const DUPLEX_CAPACITY: usize = 4096;
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Settings for a bus-bridged serial link.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub server_url: String,
    pub credentials: Option<Credentials>,
    /// Topic bytes written by the host are published to.
    pub publish_topic: String,
    /// Topic the board's output arrives on.
    pub subscribe_topic: String,
}

/// Split a broker URL such as `mqtt://broker.local:1883` into host and port.
pub fn parse_server_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .split_once("://")
        .map(|(scheme, rest)| match scheme {
            "mqtt" | "tcp" => Ok(rest),
            other => Err(Error::Config(format!("unsupported bus scheme '{}'", other))),
        })
        .transpose()?
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(Error::Config(format!("bus server URL '{}' has no host", url)));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid bus port in '{}'", url)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), DEFAULT_BROKER_PORT)),
    }
}

/// Start a bus client and bridge it to a virtual serial stream.
///
/// The client handle is reported immediately so that teardown can stop it
/// even before the broker answers. The stream is reported once, on the
/// first acknowledged session. Bus errors are faults; the client keeps
/// retrying until it is closed.
pub fn open(options: BridgeOptions, events: EventSink) {
    let (host, port) = match parse_server_url(&options.server_url) {
        Ok(addr) => addr,
        Err(e) => {
            events(TransportEvent::Failed(e));
            return;
        }
    };

    let client_id = format!(
        "boardlink-{}-{}",
        std::process::id(),
        CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let mut mqtt_options = MqttOptions::new(client_id, host.clone(), port);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    if let Some(creds) = &options.credentials {
        mqtt_options.set_credentials(creds.username.clone(), creds.password.clone());
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
    let (board_side, bridge_side) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (bridge_rx, bridge_tx) = tokio::io::split(bridge_side);
    let (start_tx, start_rx) = oneshot::channel();

    let uplink = tokio::spawn(uplink(
        bridge_rx,
        client.clone(),
        options.publish_topic.clone(),
    ));
    let downlink = tokio::spawn(downlink(
        start_rx,
        eventloop,
        client.clone(),
        options.subscribe_topic.clone(),
        board_side,
        bridge_tx,
        format!("{}:{}", host, port),
        events.clone(),
    ));

    events(TransportEvent::Acquired(
        CloseSlot::Bus,
        Box::new(BusClient {
            client: Some(client),
            tasks: vec![downlink, uplink],
        }),
    ));
    // The handle is reported; the session may now produce events.
    let _ = start_tx.send(());
}

// Host -> board: publish whatever the board adapter writes.
async fn uplink(mut rx: ReadHalf<DuplexStream>, client: AsyncClient, topic: String) {
    let mut buf = vec![0u8; DUPLEX_CAPACITY];
    loop {
        match rx.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(topic = %topic, bytes = %hex::encode(&buf[..n]), "Publishing.");
                if let Err(e) = client
                    .publish(topic.clone(), QoS::AtMostOnce, false, buf[..n].to_vec())
                    .await
                {
                    warn!(topic = %topic, error = %e, "Publish failed.");
                }
            }
            Err(e) => {
                debug!(error = %e, "Bridge uplink closed.");
                break;
            }
        }
    }
}

// Board -> host: drive the bus event loop and feed subscribed payloads
// into the virtual stream.
async fn downlink(
    start: oneshot::Receiver<()>,
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    board_side: DuplexStream,
    mut tx: WriteHalf<DuplexStream>,
    peer: String,
    events: EventSink,
) {
    if start.await.is_err() {
        return;
    }
    let mut board_side = Some(board_side);
    // Faults are reported once per outage, not once per retry.
    let mut outage = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!(peer = %peer, "Bus session established.");
                outage = false;
                if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                    events(TransportEvent::Fault(e.into()));
                }
                if let Some(stream) = board_side.take() {
                    events(TransportEvent::Opened(OpenedTransport {
                        stream: Box::new(stream),
                        peer: peer.clone(),
                        announce: true,
                    }));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                let payload: Bytes = publish.payload;
                trace!(topic = %topic, bytes = %hex::encode(&payload), "Received.");
                if let Err(e) = tx.write_all(&payload).await {
                    debug!(error = %e, "Bridge downlink closed.");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if !outage {
                    warn!(peer = %peer, error = %e, "Bus connection error.");
                    events(TransportEvent::Fault(Error::Bus(e.to_string())));
                    outage = true;
                } else {
                    trace!(peer = %peer, error = %e, "Bus still unreachable.");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Bus client owned by a bridged connection.
pub struct BusClient {
    client: Option<AsyncClient>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Closeable for BusClient {
    fn label(&self) -> &'static str {
        "bus client"
    }

    async fn close(&mut self) -> Result<()> {
        let result = match self.client.take() {
            Some(client) => client.try_disconnect().map_err(Error::from),
            None => Ok(()),
        };
        for task in self.tasks.drain(..) {
            task.abort();
        }
        result
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
