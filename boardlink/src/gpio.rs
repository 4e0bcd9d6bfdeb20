//! Pin nodes: translate host messages into board commands.
//!
//! An [`OutputNode`] turns each inbound message into at most one write or
//! I2C request; an [`InputNode`] sets a pin up for push-style reads and
//! forwards every reading. Payloads are coerced the way the host's loose
//! equality does it, so `true`, `1`, `"1"` and `"on"` all switch a pin on.
//! Command failures are logged and never propagate to the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::board::firmata::PinMode;
use crate::board::PinIo;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const DEFAULT_ANALOG_SAMPLING_MS: u16 = 300;
const PWM_MAX: f64 = 255.0;
const SERVO_MAX: f64 = 180.0;

/// A host message, as seen by pin nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeMessage {
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<Value>,
    /// Overrides the node's configured mode for this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c_address: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c_register: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_bytes: Option<u8>,
}

impl NodeMessage {
    pub fn with_payload(payload: impl Into<Value>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }
}

/// Logical level for a digital write, or `None` if the payload is neither
/// on nor off.
pub fn digital_level(payload: &Value) -> Option<u8> {
    match payload {
        Value::Bool(on) => Some(*on as u8),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "on" => Some(1),
            "off" => Some(0),
            _ => number(payload).and_then(level_of),
        },
        _ => number(payload).and_then(level_of),
    }
}

fn level_of(n: f64) -> Option<u8> {
    if n == 1.0 {
        Some(1)
    } else if n == 0.0 {
        Some(0)
    } else {
        None
    }
}

/// Numeric value of a payload under host coercion rules.
///
/// Blank strings are zero; anything that is not a number is `None`.
pub fn number(payload: &Value) -> Option<f64> {
    match payload {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(*b as u8 as f64),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Leading integer of a value, as the host's `parseInt` reads it.
pub fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim_start();
            let (sign, digits) = match s.strip_prefix('-') {
                Some(rest) => (-1, rest),
                None => (1, s.strip_prefix('+').unwrap_or(s)),
            };
            let end = digits
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(digits.len());
            digits[..end].parse::<i64>().ok().map(|n| sign * n)
        }
        _ => None,
    }
}

/// Nonzero byte from a loosely typed field.
fn nonzero_byte(value: Option<&Value>) -> Option<u8> {
    value
        .and_then(parse_int)
        .filter(|&n| n != 0)
        .and_then(|n| u8::try_from(n).ok())
}

fn payload_bytes(payload: &Value) -> Option<Vec<u8>> {
    match payload {
        Value::Array(items) => items
            .iter()
            .map(|v| parse_int(v).and_then(|n| u8::try_from(n).ok()))
            .collect(),
        Value::Null | Value::Bool(false) => None,
        other => parse_int(other)
            .and_then(|n| u8::try_from(n).ok())
            .map(|b| vec![b]),
    }
}

/// What an output node does with its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputMode {
    Output,
    Pwm,
    Servo,
    I2cReadRequest,
    I2cWriteRequest,
    I2cDelay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub pin: u8,
    #[serde(rename = "state")]
    pub mode: OutputMode,
    #[serde(default)]
    pub i2c_address: Option<u8>,
    #[serde(default)]
    pub i2c_register: Option<u8>,
}

/// Translates inbound messages into writes on one pin or I2C device.
pub struct OutputNode<P> {
    config: OutputConfig,
    io: P,
}

impl<P: PinIo> OutputNode<P> {
    pub fn new(config: OutputConfig, io: P) -> Self {
        Self { config, io }
    }

    /// Handle one message. Reads produce a reply message.
    ///
    /// Failures are logged here and not returned.
    pub async fn handle(&self, msg: &NodeMessage) -> Option<NodeMessage> {
        match self.apply(msg).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(pin = self.config.pin, mode = %self.config.mode, error = %e, "Output command failed.");
                None
            }
        }
    }

    fn mode_for(&self, msg: &NodeMessage) -> OutputMode {
        msg.state
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.config.mode)
    }

    async fn set_mode(&self, mode: PinMode) {
        if let Err(e) = self.io.pin_mode(self.config.pin, mode).await {
            debug!(pin = self.config.pin, mode = %mode, error = %e, "Could not set pin mode.");
        }
    }

    fn address(&self, msg: &NodeMessage) -> Option<u8> {
        nonzero_byte(msg.i2c_address.as_ref()).or(self.config.i2c_address.filter(|&a| a != 0))
    }

    fn register(&self, msg: &NodeMessage) -> Option<u8> {
        nonzero_byte(msg.i2c_register.as_ref()).or(self.config.i2c_register.filter(|&r| r != 0))
    }

    async fn apply(&self, msg: &NodeMessage) -> Result<Option<NodeMessage>> {
        let pin = self.config.pin;
        match self.mode_for(msg) {
            OutputMode::Output => {
                self.set_mode(PinMode::Output).await;
                match digital_level(&msg.payload) {
                    Some(level) => self.io.digital_write(pin, level).await?,
                    None => trace!(pin, payload = %msg.payload, "Payload is neither on nor off."),
                }
                Ok(None)
            }
            OutputMode::Pwm => {
                self.set_mode(PinMode::Pwm).await;
                match number(&msg.payload).filter(|n| (0.0..=PWM_MAX).contains(n)) {
                    Some(value) => self.io.analog_write(pin, value.round() as u16).await?,
                    None => debug!(pin, payload = %msg.payload, "PWM value out of range, ignoring."),
                }
                Ok(None)
            }
            OutputMode::Servo => {
                self.set_mode(PinMode::Servo).await;
                match number(&msg.payload).filter(|n| (0.0..=SERVO_MAX).contains(n)) {
                    Some(degrees) => self.io.servo_write(pin, degrees.round() as u16).await?,
                    None => debug!(pin, payload = %msg.payload, "Servo angle out of range, ignoring."),
                }
                Ok(None)
            }
            OutputMode::I2cReadRequest => {
                let register = self.register(msg);
                let len = parse_int(&msg.payload)
                    .filter(|&n| n > 0)
                    .and_then(|n| u8::try_from(n).ok());
                let (Some(address), Some(len)) = (self.address(msg), len) else {
                    debug!(payload = %msg.payload, "I2C read needs an address and a byte count.");
                    return Ok(None);
                };
                let data = self.io.i2c_read_once(address, register, len).await?;
                Ok(Some(NodeMessage {
                    payload: Value::from(data),
                    i2c_address: Some(Value::from(address)),
                    register,
                    num_bytes: Some(len),
                    ..NodeMessage::default()
                }))
            }
            OutputMode::I2cWriteRequest => {
                let (Some(address), Some(data)) = (self.address(msg), payload_bytes(&msg.payload))
                else {
                    debug!(payload = %msg.payload, "I2C write needs an address and bytes.");
                    return Ok(None);
                };
                self.io.i2c_write(address, self.register(msg), &data).await?;
                Ok(None)
            }
            OutputMode::I2cDelay => {
                let delay = parse_int(&msg.payload)
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| Error::Command(format!("invalid I2C delay {}", msg.payload)))?;
                self.io.i2c_config(delay).await?;
                Ok(None)
            }
        }
    }
}

/// What an input node reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InputMode {
    Input,
    Pullup,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub pin: u8,
    #[serde(rename = "state")]
    pub mode: InputMode,
    #[serde(default)]
    pub sampling_interval: Option<u16>,
}

/// Forwards readings from one pin.
pub struct InputNode<P> {
    config: InputConfig,
    io: P,
}

impl<P: PinIo> InputNode<P> {
    pub fn new(config: InputConfig, io: P) -> Self {
        Self { config, io }
    }

    /// Configure the pin and forward every reading to `out`.
    ///
    /// The returned task ends when the board stops reporting or `out` is
    /// closed.
    pub async fn start(&self, out: mpsc::Sender<NodeMessage>) -> Result<JoinHandle<()>> {
        let pin = self.config.pin;
        let topic = Value::from(pin);
        match self.config.mode {
            InputMode::Analog => {
                let interval = self
                    .config
                    .sampling_interval
                    .filter(|&ms| ms > 0)
                    .unwrap_or(DEFAULT_ANALOG_SAMPLING_MS);
                if let Err(e) = self.io.set_sampling_interval(interval).await {
                    debug!(pin, error = %e, "Could not set sampling interval.");
                }
                if let Err(e) = self.io.pin_mode(pin, PinMode::Analog).await {
                    debug!(pin, error = %e, "Could not set pin mode.");
                }
                let readings = self.io.analog_read(pin).await?;
                Ok(tokio::spawn(forward(readings, out, topic)))
            }
            InputMode::Input | InputMode::Pullup => {
                let mode = match self.config.mode {
                    InputMode::Pullup => PinMode::Pullup,
                    _ => PinMode::Input,
                };
                if let Err(e) = self.io.pin_mode(pin, mode).await {
                    debug!(pin, error = %e, "Could not set pin mode.");
                }
                let readings = self.io.digital_read(pin).await?;
                Ok(tokio::spawn(forward(readings, out, topic)))
            }
        }
    }
}

async fn forward<T: Into<Value>>(
    mut readings: mpsc::Receiver<T>,
    out: mpsc::Sender<NodeMessage>,
    topic: Value,
) {
    while let Some(reading) = readings.recv().await {
        let msg = NodeMessage {
            payload: reading.into(),
            topic: Some(topic.clone()),
            ..NodeMessage::default()
        };
        if out.send(msg).await.is_err() {
            break;
        }
    }
}
