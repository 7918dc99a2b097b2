//! # busytag
//!
//! Host-side engine for BusyTag USB-serial LED badges.
//!
//! The crate owns the serial link to a device and provides:
//!
//! - Device discovery with deduplicated change notifications
//! - A per-device session with a typed command surface
//! - Strictly ordered command dispatch (one command in flight per device)
//! - Chunked file upload and download with progress events and cancellation
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use busytag::{DeviceSession, LedMask, Rgb, SessionConfig};
//!
//! fn main() -> busytag::Result<()> {
//!     let session = DeviceSession::native(SessionConfig::default());
//!     let identity = session.connect("/dev/ttyACM0")?;
//!     println!("{} running firmware {}", identity.name, identity.firmware_version);
//!
//!     session.set_color(Rgb::new(255, 0, 0), LedMask::ALL)?;
//!
//!     let image = std::fs::read("coffee.gif")?;
//!     session.upload("coffee.gif", image.as_slice(), image.len() as u64)?;
//!     session.show_picture("coffee.gif")?;
//!
//!     session.disconnect();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod led;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "native")]
pub use port::{NativeConnector, NativePort, NativePortEnumerator};
pub use {
    discovery::{ChangeGate, DEFAULT_DEVICE_PREFIX, DiscoveryConfig, DiscoveryManager},
    dispatcher::Dispatcher,
    error::{Error, Result},
    event::{DeviceEvent, EventBus, SubscriptionId},
    led::{LedMask, PatternStep, Rgb},
    port::{Connector, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{MAX_FILENAME_LEN, is_firmware_name, validate_file_name},
    session::{
        DeviceIdentity, DeviceSession, FileEntry, MAX_BRIGHTNESS, SessionConfig, SessionState,
        StorageInfo,
    },
    transfer::{DEFAULT_CHUNK_SIZE, TransferConfig, TransferDirection, TransferJob},
    transport::Transport,
};
