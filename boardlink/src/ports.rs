//! Locally attachable serial devices.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::Result;
use crate::tracing::prelude::*;

/// Device names that look like a USB, ACM or COM serial port.
static BOARD_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)usb|acm|com\d+").expect("valid port pattern"));

/// Keep the device paths that look like board serial ports, in order.
pub fn filter_board_ports<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .filter(|name| BOARD_PORT.is_match(name))
        .collect()
}

/// List serial devices a board could be attached to.
pub fn list_board_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()?;
    let names = filter_board_ports(ports.into_iter().map(|p| p.port_name));
    debug!(count = names.len(), "Listed serial ports.");
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_usb_acm_and_com_ports() {
        let ports = filter_board_ports([
            "/dev/ttyS0",
            "/dev/ttyUSB0",
            "/dev/ttyACM1",
            "COM3",
            "/dev/cu.usbmodem1421",
            "/dev/ttyAMA0",
            "COM",
        ]);
        assert_eq!(
            ports,
            vec!["/dev/ttyUSB0", "/dev/ttyACM1", "COM3", "/dev/cu.usbmodem1421"]
        );
    }

    #[test]
    fn listing_does_not_fail_without_ports() {
        // Enumeration may legitimately find nothing in a sandbox.
        if let Ok(ports) = list_board_ports() {
            assert!(ports.iter().all(|p| BOARD_PORT.is_match(p)));
        }
    }
}
