//! Port abstraction for serial communication.
//!
//! The engine never talks to the OS directly. Everything above this module
//! goes through three small traits:
//!
//! - [`Port`]: an open byte channel (`Read + Write`) with timeout control
//! - [`Connector`]: opens a [`Port`] by name
//! - [`PortEnumerator`]: lists the serial ports currently visible
//!
//! ```text
//! +-------------------------------+
//! | Session / Discovery / Transfer|
//! +---------------+---------------+
//!                 |
//!                 v
//! +---------------+---------------+
//! |   Transport (line framing)    |
//! +---------------+---------------+
//!                 |
//!                 v
//! +---------------+---------------+
//! |  Port trait  (Connector opens)|
//! +-------+---------------+-------+
//!         |               |
//!   NativePort       scripted mock
//!  (serialport)        (tests)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use busytag::port::{Connector, NativeConnector, SerialConfig};
//! use std::io::Write;
//!
//! fn main() -> busytag::Result<()> {
//!     let mut port = NativeConnector.open(&SerialConfig::new("/dev/ttyACM0"))?;
//!     port.write_all(b"AT+GDN\r\n")?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate of BusyTag devices.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial port configuration.
///
/// Framing is fixed at 8 data bits, no parity, one stop bit and no flow
/// control; only the port, speed and base timeout vary.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout used when the port is opened.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a configuration for the given port at the default baud rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Create a port entry with no USB metadata.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the port is backed by a USB device.
    pub fn is_usb(&self) -> bool {
        self.vid.is_some()
    }
}

/// An open serial channel.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Discard any bytes pending in the input and output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// Must be idempotent. After calling this method, I/O on the port fails.
    fn close(&mut self) -> Result<()>;
}

/// Opens ports by name.
pub trait Connector: Send + Sync {
    /// Open the port described by `config`.
    ///
    /// Fails with [`crate::Error::PortUnavailable`] if the OS denies access
    /// or the port does not exist.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

/// Lists the serial ports visible to the system.
pub trait PortEnumerator: Send + Sync {
    /// List all available serial ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativeConnector, NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert!(config.port_name.is_empty());
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0")
            .with_baud(230_400)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 230_400);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_port_info_is_usb() {
        assert!(!PortInfo::named("/dev/ttyS0").is_usb());
        let usb = PortInfo {
            vid: Some(0x303A),
            pid: Some(0x81DF),
            ..PortInfo::named("/dev/ttyACM0")
        };
        assert!(usb.is_usb());
    }
}
