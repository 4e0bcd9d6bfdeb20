//! Firmata wire protocol codec.
//!
//! Only the subset of Firmata the control surface needs is implemented:
//! version and firmware reports, pin modes, digital and analog I/O, report
//! toggles, sampling interval and I2C.
//!
//! Multi-byte values travel as 7-bit little-endian groups; every command
//! byte has the high bit set and every data byte has it clear, which is what
//! the decoder uses to resynchronize after garbage.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::registry::BoardDescriptor;
use super::{Board, BoardInit};
use crate::tracing::prelude::*;
use crate::transport::TransportKind;

pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const SET_PIN_MODE: u8 = 0xF4;
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
pub const REPORT_VERSION: u8 = 0xF9;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;

/// Sysex command bytes.
pub mod sysex {
    pub const EXTENDED_ANALOG: u8 = 0x6F;
    pub const I2C_REQUEST: u8 = 0x76;
    pub const I2C_REPLY: u8 = 0x77;
    pub const I2C_CONFIG: u8 = 0x78;
    pub const REPORT_FIRMWARE: u8 = 0x79;
    pub const SAMPLING_INTERVAL: u8 = 0x7A;
}

// Bits 3-4 of the second I2C request byte.
const I2C_MODE_WRITE: u8 = 0b00 << 3;
const I2C_MODE_READ_ONCE: u8 = 0b01 << 3;

// A sysex frame this long without an END_SYSEX is garbage.
const MAX_SYSEX_LEN: usize = 1024;

/// Pin modes understood by Firmata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    I2c,
    Pullup,
}

impl PinMode {
    pub fn code(self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
            PinMode::Servo => 0x04,
            PinMode::I2c => 0x06,
            PinMode::Pullup => 0x0B,
        }
    }
}

/// Messages sent to the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryVersion,
    QueryFirmware,
    SetPinMode { pin: u8, mode: PinMode },
    DigitalWrite { pin: u8, value: u8 },
    AnalogWrite { pin: u8, value: u16 },
    ReportDigital { port: u8, enable: bool },
    ReportAnalog { channel: u8, enable: bool },
    SamplingInterval { millis: u16 },
    I2cConfig { delay_us: u16 },
    I2cWrite { address: u8, register: Option<u8>, data: Vec<u8> },
    I2cReadOnce { address: u8, register: Option<u8>, len: u8 },
}

/// Messages received from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version { major: u8, minor: u8 },
    Firmware { major: u8, minor: u8, name: String },
    /// Pin states of one 8-pin port, pin 0 of the port in bit 0.
    DigitalPort { port: u8, mask: u8 },
    Analog { channel: u8, value: u16 },
    I2cReply { address: u8, register: u8, data: Vec<u8> },
}

fn put_u14(dst: &mut BytesMut, value: u16) {
    dst.put_u8((value & 0x7F) as u8);
    dst.put_u8(((value >> 7) & 0x7F) as u8);
}

fn u14(lsb: u8, msb: u8) -> u16 {
    (lsb as u16 & 0x7F) | ((msb as u16 & 0x7F) << 7)
}

/// Codec for the Firmata byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirmataCodec;

impl Encoder<Command> for FirmataCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match &command {
            Command::QueryVersion => dst.put_u8(REPORT_VERSION),
            Command::QueryFirmware => {
                dst.put_slice(&[START_SYSEX, sysex::REPORT_FIRMWARE, END_SYSEX]);
            }
            Command::SetPinMode { pin, mode } => {
                dst.put_slice(&[SET_PIN_MODE, pin & 0x7F, mode.code()]);
            }
            Command::DigitalWrite { pin, value } => {
                dst.put_slice(&[SET_DIGITAL_PIN_VALUE, pin & 0x7F, (*value != 0) as u8]);
            }
            Command::AnalogWrite { pin, value } if *pin < 16 => {
                dst.put_u8(ANALOG_MESSAGE | pin);
                put_u14(dst, *value);
            }
            Command::AnalogWrite { pin, value } => {
                dst.put_slice(&[START_SYSEX, sysex::EXTENDED_ANALOG, pin & 0x7F]);
                put_u14(dst, *value);
                if *value > 0x3FFF {
                    dst.put_u8(((value >> 14) & 0x7F) as u8);
                }
                dst.put_u8(END_SYSEX);
            }
            Command::ReportDigital { port, enable } => {
                dst.put_slice(&[REPORT_DIGITAL | (port & 0x0F), *enable as u8]);
            }
            Command::ReportAnalog { channel, enable } => {
                dst.put_slice(&[REPORT_ANALOG | (channel & 0x0F), *enable as u8]);
            }
            Command::SamplingInterval { millis } => {
                dst.put_slice(&[START_SYSEX, sysex::SAMPLING_INTERVAL]);
                put_u14(dst, *millis);
                dst.put_u8(END_SYSEX);
            }
            Command::I2cConfig { delay_us } => {
                dst.put_slice(&[START_SYSEX, sysex::I2C_CONFIG]);
                put_u14(dst, *delay_us);
                dst.put_u8(END_SYSEX);
            }
            Command::I2cWrite {
                address,
                register,
                data,
            } => {
                dst.put_slice(&[START_SYSEX, sysex::I2C_REQUEST, address & 0x7F, I2C_MODE_WRITE]);
                for byte in register.iter().chain(data.iter()) {
                    put_u14(dst, *byte as u16);
                }
                dst.put_u8(END_SYSEX);
            }
            Command::I2cReadOnce {
                address,
                register,
                len,
            } => {
                dst.put_slice(&[
                    START_SYSEX,
                    sysex::I2C_REQUEST,
                    address & 0x7F,
                    I2C_MODE_READ_ONCE,
                ]);
                if let Some(register) = register {
                    put_u14(dst, *register as u16);
                }
                put_u14(dst, *len as u16);
                dst.put_u8(END_SYSEX);
            }
        }
        trace!(?command, bytes = %hex::encode(&dst[start..]), "Encoded.");
        Ok(())
    }
}

fn decode_sysex(body: &[u8]) -> Option<Message> {
    let (&command, data) = body.split_first()?;
    match command {
        sysex::REPORT_FIRMWARE if data.len() >= 2 => {
            let name: String = data[2..]
                .chunks_exact(2)
                .filter_map(|pair| char::from_u32(u14(pair[0], pair[1]) as u32))
                .collect();
            Some(Message::Firmware {
                major: data[0],
                minor: data[1],
                name,
            })
        }
        sysex::I2C_REPLY if data.len() >= 4 => {
            let address = u14(data[0], data[1]) as u8;
            let register = u14(data[2], data[3]) as u8;
            let bytes = data[4..]
                .chunks_exact(2)
                .map(|pair| u14(pair[0], pair[1]) as u8)
                .collect();
            Some(Message::I2cReply {
                address,
                register,
                data: bytes,
            })
        }
        other => {
            trace!(command = other, len = data.len(), "Ignoring sysex.");
            None
        }
    }
}

impl Decoder for FirmataCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Skip data bytes until something that starts a message.
            let Some(start) = src.iter().position(|b| b & 0x80 != 0) else {
                src.clear();
                return Ok(None);
            };
            if start > 0 {
                trace!(skipped = start, "Discarding stray data bytes.");
                src.advance(start);
            }

            let command = src[0];
            match command {
                START_SYSEX => {
                    let Some(end) = src.iter().position(|&b| b == END_SYSEX) else {
                        if src.len() > MAX_SYSEX_LEN {
                            warn!(len = src.len(), "Unterminated sysex, discarding.");
                            src.clear();
                        }
                        return Ok(None);
                    };
                    let frame = src.split_to(end + 1);
                    if let Some(message) = decode_sysex(&frame[1..end]) {
                        return Ok(Some(message));
                    }
                }
                REPORT_VERSION | DIGITAL_MESSAGE..=0x9F | ANALOG_MESSAGE..=0xEF => {
                    if src.len() < 3 {
                        return Ok(None);
                    }
                    if src[1] & 0x80 != 0 || src[2] & 0x80 != 0 {
                        // Truncated message; resync on the next command byte.
                        src.advance(1);
                        continue;
                    }
                    let frame = src.split_to(3);
                    let message = match command {
                        REPORT_VERSION => Message::Version {
                            major: frame[1],
                            minor: frame[2],
                        },
                        c if c & 0xF0 == DIGITAL_MESSAGE => Message::DigitalPort {
                            port: c & 0x0F,
                            mask: (u14(frame[1], frame[2]) & 0xFF) as u8,
                        },
                        c => Message::Analog {
                            channel: c & 0x0F,
                            value: u14(frame[1], frame[2]),
                        },
                    };
                    return Ok(Some(message));
                }
                _ => {
                    trace!(command, "Ignoring unsupported command byte.");
                    src.advance(1);
                }
            }
        }
    }
}

fn create(init: BoardInit) -> crate::error::Result<Board> {
    Board::attach("firmata", init)
}

fn create_playground(init: BoardInit) -> crate::error::Result<Board> {
    Board::attach("playground-io", init)
}

inventory::submit! {
    BoardDescriptor {
        name: "firmata",
        transports: &[
            TransportKind::Local,
            TransportKind::TcpClient,
            TransportKind::TcpListener,
            TransportKind::Udp,
            TransportKind::BridgedSerial,
        ],
        create_fn: create,
    }
}

// Circuit Playground boards run Firmata over their USB serial port only.
inventory::submit! {
    BoardDescriptor {
        name: "playground-io",
        transports: &[TransportKind::Local],
        create_fn: create_playground,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_case::test_case;

    fn encode(command: Command) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FirmataCodec.encode(command, &mut buf).unwrap();
        buf.to_vec()
    }

    fn decode_all(bytes: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(message) = FirmataCodec.decode(&mut buf).unwrap() {
            out.push(message);
        }
        out
    }

    #[test_case(Command::QueryVersion, &[0xF9]; "version query")]
    #[test_case(Command::SetPinMode { pin: 13, mode: PinMode::Output }, &[0xF4, 13, 1]; "pin mode")]
    #[test_case(Command::DigitalWrite { pin: 13, value: 1 }, &[0xF5, 13, 1]; "digital write")]
    #[test_case(Command::AnalogWrite { pin: 3, value: 255 }, &[0xE3, 0x7F, 0x01]; "analog write")]
    #[test_case(Command::AnalogWrite { pin: 20, value: 127 }, &[0xF0, 0x6F, 20, 0x7F, 0x00, 0xF7]; "extended analog")]
    #[test_case(Command::ReportDigital { port: 1, enable: true }, &[0xD1, 1]; "report digital")]
    #[test_case(Command::SamplingInterval { millis: 500 }, &[0xF0, 0x7A, 0x74, 0x03, 0xF7]; "sampling interval")]
    #[test_case(Command::I2cReadOnce { address: 0x48, register: Some(0x01), len: 2 },
        &[0xF0, 0x76, 0x48, 0x08, 0x01, 0x00, 0x02, 0x00, 0xF7]; "i2c read once")]
    #[test_case(Command::I2cWrite { address: 0x70, register: None, data: vec![0x81] },
        &[0xF0, 0x76, 0x70, 0x00, 0x01, 0x01, 0xF7]; "i2c write")]
    fn encodes(command: Command, expected: &[u8]) {
        assert_eq!(encode(command), expected);
    }

    #[test]
    fn decodes_mixed_stream() {
        let messages = decode_all(&[
            0xF9, 2, 5, // version
            0x91, 0x05, 0x01, // port 1, pins 8, 10 and 15
            0xE2, 0x7F, 0x07, // analog channel 2 = 1023
            0xF0, 0x77, 0x48, 0x00, 0x01, 0x00, 0x12, 0x00, 0x34, 0x00, 0xF7,
        ]);
        assert_eq!(
            messages,
            vec![
                Message::Version { major: 2, minor: 5 },
                Message::DigitalPort { port: 1, mask: 0x85 },
                Message::Analog {
                    channel: 2,
                    value: 1023
                },
                Message::I2cReply {
                    address: 0x48,
                    register: 0x01,
                    data: vec![0x12, 0x34]
                },
            ]
        );
    }

    #[test]
    fn decodes_firmware_name() {
        let messages = decode_all(&[0xF0, 0x79, 2, 5, b'F', 0, b'w', 0, 0xF7]);
        assert_eq!(
            messages,
            vec![Message::Firmware {
                major: 2,
                minor: 5,
                name: "Fw".into()
            }]
        );
    }

    #[test]
    fn waits_for_complete_frames() {
        let mut buf = BytesMut::from(&[0xF9, 2][..]);
        assert_eq!(FirmataCodec.decode(&mut buf).unwrap(), None);
        buf.put_u8(5);
        assert_eq!(
            FirmataCodec.decode(&mut buf).unwrap(),
            Some(Message::Version { major: 2, minor: 5 })
        );
    }

    #[test]
    fn resyncs_after_garbage() {
        let messages = decode_all(&[0x01, 0x02, 0xF9, 0xE0, 0x00, 0xF9, 2, 5, 0xFF]);
        assert_eq!(messages, vec![Message::Version { major: 2, minor: 5 }]);
    }

    #[test]
    fn parses_pin_mode_names() {
        assert_eq!(PinMode::from_str("PWM").ok(), Some(PinMode::Pwm));
        assert_eq!(PinMode::from_str("PULLUP").ok(), Some(PinMode::Pullup));
        assert_eq!(PinMode::Servo.to_string(), "SERVO");
    }
}
