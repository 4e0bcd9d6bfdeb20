//! Configuration for connection nodes and the daemon.
//!
//! [`NodeConfig`] mirrors what the host editor stores for a connection
//! node: loosely typed, with empty strings for unused fields and numbers
//! that may arrive as text. [`NodeConfig::validate`] turns it into a
//! [`ValidatedConfig`] before any I/O happens, so misconfiguration is
//! reported once, up front.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::board::{BoardDescriptor, BoardRegistry, ConnectionId};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{bridge, serial, Credentials, TransportConfig, TransportKind};

pub const DEFAULT_BOARD_TYPE: &str = "firmata";
pub const DEFAULT_SAMPLING_INTERVAL_MS: u16 = 500;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_CONFIG_PATH: &str = "/etc/boardlink/connections.json";
pub const DEFAULT_API_LISTEN: &str = "127.0.0.1:7786";

/// Handshake timeout from the environment, or the default.
fn get_handshake_timeout() -> Duration {
    std::env::var("BOARDLINK_HANDSHAKE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Number(u64),
    Text(String),
}

/// Accept a number, a numeric string, an empty string or null.
fn loose_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let number = match Option::<LooseNumber>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(LooseNumber::Number(n)) => n,
        Some(LooseNumber::Text(s)) if s.trim().is_empty() => return Ok(None),
        Some(LooseNumber::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| de::Error::custom(format!("'{}' is not a number", s)))?,
    };
    T::try_from(number)
        .map(Some)
        .map_err(|_| de::Error::custom(format!("{} is out of range", number)))
}

/// Per-node configuration as stored by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub id: String,
    pub name: Option<String>,
    pub board_type: Option<String>,
    pub connection_type: Option<String>,
    pub serialport_name: Option<String>,
    #[serde(deserialize_with = "loose_number")]
    pub baud_rate: Option<u32>,
    pub tcp_host: Option<String>,
    #[serde(deserialize_with = "loose_number")]
    pub tcp_port: Option<u16>,
    #[serde(alias = "busServerURL")]
    pub mqtt_server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "publishTopic")]
    pub pub_topic: Option<String>,
    #[serde(alias = "subscribeTopic")]
    pub sub_topic: Option<String>,
    #[serde(deserialize_with = "loose_number")]
    pub sampling_interval: Option<u16>,
    /// Handshake timeout in milliseconds.
    #[serde(deserialize_with = "loose_number")]
    pub handshake_timeout: Option<u64>,
}

fn text(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(field: &'a Option<String>, name: &str, kind: TransportKind) -> Result<&'a str> {
    text(field).ok_or_else(|| {
        Error::Config(format!("{} connections require '{}'", kind, name))
    })
}

fn required_port(port: Option<u16>, kind: TransportKind) -> Result<u16> {
    match port {
        Some(port) if port != 0 => Ok(port),
        Some(_) => Err(Error::Config(format!("{} connections need a nonzero 'tcpPort'", kind))),
        None => Err(Error::Config(format!("{} connections require 'tcpPort'", kind))),
    }
}

/// A node configuration that has passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub id: ConnectionId,
    pub board: &'static BoardDescriptor,
    pub transport: TransportConfig,
    pub sampling_interval: u16,
    pub handshake_timeout: Duration,
}

impl NodeConfig {
    /// Resolve board and transport kinds and check required fields.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let kind_name = text(&self.connection_type).unwrap_or("local");
        let kind = TransportKind::from_str(kind_name)
            .map_err(|_| Error::Config(format!("unknown connection type '{}'", kind_name)))?;
        let board_type = text(&self.board_type).unwrap_or(DEFAULT_BOARD_TYPE);
        let board = BoardRegistry.resolve(board_type, kind)?;

        let transport = match kind {
            TransportKind::Local => TransportConfig::Local {
                path: required(&self.serialport_name, "serialportName", kind)?.to_string(),
                baud_rate: self.baud_rate.unwrap_or(serial::DEFAULT_BAUD_RATE),
            },
            TransportKind::TcpClient => TransportConfig::TcpClient {
                host: required(&self.tcp_host, "tcpHost", kind)?.to_string(),
                port: required_port(self.tcp_port, kind)?,
            },
            TransportKind::TcpListener => TransportConfig::TcpListener {
                port: required_port(self.tcp_port, kind)?,
            },
            TransportKind::Udp => TransportConfig::Udp {
                host: required(&self.tcp_host, "tcpHost", kind)?.to_string(),
                port: required_port(self.tcp_port, kind)?,
            },
            TransportKind::BridgedSerial => {
                let server_url = required(&self.mqtt_server, "mqttServer", kind)?;
                bridge::parse_server_url(server_url)?;
                let credentials = text(&self.username).map(|username| Credentials {
                    username: username.to_string(),
                    password: self.password.clone().unwrap_or_default(),
                });
                TransportConfig::BridgedSerial {
                    server_url: server_url.to_string(),
                    credentials,
                    publish_topic: required(&self.pub_topic, "pubTopic", kind)?.to_string(),
                    subscribe_topic: required(&self.sub_topic, "subTopic", kind)?.to_string(),
                }
            }
        };

        let handshake_timeout = match self.handshake_timeout {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => get_handshake_timeout(),
        };

        Ok(ValidatedConfig {
            id: ConnectionId::new(self.id.clone()),
            board,
            transport,
            sampling_interval: self
                .sampling_interval
                .filter(|&ms| ms > 0)
                .unwrap_or(DEFAULT_SAMPLING_INTERVAL_MS),
            handshake_timeout,
        })
    }
}

/// Daemon configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub connections: Vec<NodeConfig>,
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    DEFAULT_API_LISTEN.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Configuration file location, from `BOARDLINK_CONFIG` or the default.
    pub fn path() -> PathBuf {
        std::env::var_os("BOARDLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from the default location.
    ///
    /// A missing file yields an empty configuration.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            warn!(path = %path.display(), "No configuration file, starting with no connections.");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), connections = config.connections.len(), "Configuration loaded.");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        let mut seen = HashSet::new();
        for node in &config.connections {
            if node.id.is_empty() {
                return Err(Error::Config("connection without an 'id'".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(Error::Config(format!("duplicate connection id '{}'", node.id)));
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn node(value: serde_json::Value) -> NodeConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn local_defaults() {
        let config = node(json!({"id": "n1", "serialportName": "/dev/ttyUSB0"}))
            .validate()
            .unwrap();
        assert_eq!(config.board.name, "firmata");
        assert_eq!(
            config.transport,
            TransportConfig::Local {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 57600
            }
        );
        assert_eq!(config.sampling_interval, 500);
    }

    #[test]
    fn numbers_may_be_strings() {
        let config = node(json!({
            "id": "n1",
            "connectionType": "tcplisten",
            "tcpPort": "9000",
            "samplingInterval": "",
            "handshakeTimeout": 250,
        }))
        .validate()
        .unwrap();
        assert_eq!(config.transport, TransportConfig::TcpListener { port: 9000 });
        assert_eq!(config.sampling_interval, 500);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bridged_serial_accepts_descriptive_names() {
        let config = node(json!({
            "id": "n1",
            "connectionType": "mqtt",
            "busServerURL": "mqtt://broker:1883",
            "username": "bot",
            "password": "secret",
            "publishTopic": "board/in",
            "subscribeTopic": "board/out",
        }))
        .validate()
        .unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::BridgedSerial {
                server_url: "mqtt://broker:1883".into(),
                credentials: Some(Credentials {
                    username: "bot".into(),
                    password: "secret".into()
                }),
                publish_topic: "board/in".into(),
                subscribe_topic: "board/out".into(),
            }
        );
    }

    #[test_case(json!({"connectionType": "serial-over-pigeon"}); "unknown connection type")]
    #[test_case(json!({"boardType": "raspi-io", "serialportName": "/dev/ttyACM0"}); "unknown board type")]
    #[test_case(json!({"serialportName": ""}); "missing serial path")]
    #[test_case(json!({"connectionType": "tcp", "tcpPort": 3030}); "missing host")]
    #[test_case(json!({"connectionType": "udp", "tcpHost": "board"}); "missing port")]
    #[test_case(json!({"connectionType": "tcplisten", "tcpPort": 0}); "zero port")]
    #[test_case(json!({"connectionType": "mqtt", "mqttServer": "ws://b", "pubTopic": "a", "subTopic": "b"}); "bad bus url")]
    #[test_case(json!({"boardType": "playground-io", "connectionType": "tcp", "tcpHost": "h", "tcpPort": 1}); "board without transport")]
    fn rejects(value: serde_json::Value) {
        assert!(matches!(node(value).validate(), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_number_fails_to_parse() {
        let parsed: std::result::Result<NodeConfig, _> =
            serde_json::from_value(json!({"tcpPort": "ninety"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn daemon_config_rejects_duplicate_ids() {
        let raw = r#"{"connections": [{"id": "a"}, {"id": "a"}]}"#;
        assert!(matches!(Config::parse(raw), Err(Error::Config(_))));
    }

    #[test]
    fn daemon_config_defaults() {
        let config = Config::parse(r#"{"connections": [{"id": "a", "serialportName": "/dev/ttyACM0"}]}"#)
            .unwrap();
        assert_eq!(config.api.listen, DEFAULT_API_LISTEN);
        assert_eq!(config.connections.len(), 1);
    }
}
