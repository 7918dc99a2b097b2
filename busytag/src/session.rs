//! Per-connection device session.
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────> Connecting ──handshake ok──> Connected <──┐
//!      ^                          │                           │         │ done
//!      │                     handshake failed                 │ upload/ │
//!      │                          │                           │ download│
//!      ├──────────────────────────┘                           v         │
//!      │                                                     Busy ──────┘
//!      │        cleanup
//!      └──────────────── Faulted <── link error (any state)
//! ```
//!
//! Every typed operation runs through the session's [`Dispatcher`], so
//! commands issued from several threads are serialized in arrival order.

use crate::dispatcher::{Dispatcher, UnsolicitedSink};
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, EventBus, SubscriptionId};
use crate::led::{LedMask, PatternStep, Rgb};
use crate::port::{Connector, DEFAULT_BAUD, SerialConfig};
use crate::protocol::{
    Expect, Request, Response, ResponseMatcher, Unsolicited, parse_file_entry, tag,
    validate_file_name,
};
use crate::transfer::{Transfer, TransferConfig};
use crate::transport::Transport;
use log::{debug, info, warn};
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Highest display brightness the device accepts.
pub const MAX_BRIGHTNESS: u8 = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Deadline for ordinary commands.
    pub command_timeout: Duration,
    /// Deadline for each identity query during `connect`.
    pub handshake_timeout: Duration,
    /// Deadline for `format_disk`, which erases the whole flash.
    pub format_timeout: Duration,
    /// Chunking and deadlines for file transfers.
    pub transfer: TransferConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD,
            command_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(1),
            format_timeout: Duration::from_secs(30),
            transfer: TransferConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Set the ordinary command deadline.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the transfer settings.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port is open.
    Disconnected,
    /// Port open, identity handshake in progress.
    Connecting,
    /// Ready for commands.
    Connected,
    /// A file transfer owns the channel.
    Busy,
    /// The link failed; cleanup in progress.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Busy => "busy",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Identity reported by the device during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// Display name, e.g. `busytag-3C84`.
    pub name: String,
    /// Manufacturer string.
    pub manufacturer: String,
    /// Unique device id.
    pub id: String,
    /// Firmware version string.
    pub firmware_version: String,
}

/// One file in device storage.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileEntry {
    /// File name, at most 40 characters.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Device storage figures. Each is `None` until queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageInfo {
    /// Total capacity in bytes.
    pub total: Option<u64>,
    /// Free space in bytes.
    pub free: Option<u64>,
}

impl StorageInfo {
    /// Used bytes, when both figures are known.
    pub fn used(&self) -> Option<u64> {
        Some(
            self.total?
                .saturating_sub(self.free?),
        )
    }
}

/// What the session remembers about the connected device.
///
/// Populated only by explicit queries and device pushes; nothing is refreshed
/// behind the caller's back.
#[derive(Debug, Clone, Default)]
struct DeviceCache {
    identity: Option<DeviceIdentity>,
    files: Option<Vec<FileEntry>>,
    storage: StorageInfo,
    brightness: Option<u8>,
    current_image: Option<String>,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    port: Option<String>,
    link: Option<Arc<Dispatcher>>,
}

/// A session with one BusyTag.
pub struct DeviceSession {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
    cache: Arc<Mutex<DeviceCache>>,
    cancel: AtomicBool,
}

impl DeviceSession {
    /// Create a disconnected session that opens ports through `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            events: Arc::new(EventBus::new()),
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                port: None,
                link: None,
            }),
            cache: Arc::new(Mutex::new(DeviceCache::default())),
            cancel: AtomicBool::new(false),
        }
    }

    /// Create a session on the operating system's serial ports.
    #[cfg(feature = "native")]
    pub fn native(config: SessionConfig) -> Self {
        Self::new(Arc::new(crate::port::NativeConnector), config)
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register an event listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.events
            .subscribe(listener)
    }

    /// Remove an event listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events
            .unsubscribe(id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// Whether a device is attached (idle or transferring).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Busy
        )
    }

    /// Port of the live connection.
    pub fn port_name(&self) -> Option<String> {
        lock(&self.inner)
            .port
            .clone()
    }

    /// Identity fetched during `connect`.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.cache)
            .identity
            .clone()
    }

    /// Open `port` and perform the identity handshake.
    pub fn connect(&self, port: &str) -> Result<DeviceIdentity> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Disconnected {
                let current = inner
                    .port
                    .clone()
                    .unwrap_or_else(|| port.to_string());
                return Err(Error::AlreadyConnected(current));
            }
            inner.state = SessionState::Connecting;
            inner.port = Some(port.to_string());
        }
        info!("Connecting to {port}");

        let serial = SerialConfig::new(port).with_baud(self.config.baud_rate);
        let transport = match Transport::open(self.connector.as_ref(), &serial) {
            Ok(t) => t,
            Err(e) => {
                self.abandon_connect();
                return Err(e);
            },
        };
        let link = Arc::new(Dispatcher::new(transport, Some(self.push_sink())));

        let identity = match self.handshake(&link) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Handshake with {port} failed: {e}");
                link.close();
                self.abandon_connect();
                return Err(e);
            },
        };

        {
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Connecting {
                // disconnect() ran while we were handshaking
                drop(inner);
                link.close();
                return Err(Error::NotConnected);
            }
            inner.state = SessionState::Connected;
            inner.link = Some(link);
        }
        *lock(&self.cache) = DeviceCache {
            identity: Some(identity.clone()),
            ..DeviceCache::default()
        };

        info!(
            "Connected to {} (firmware {}) on {port}",
            identity.name, identity.firmware_version
        );
        self.events
            .emit(&DeviceEvent::ConnectionChanged {
                port: port.to_string(),
                connected: true,
            });
        Ok(identity)
    }

    /// Close the connection and forget everything cached. Idempotent.
    pub fn disconnect(&self) {
        let (link, port) = {
            let mut inner = lock(&self.inner);
            inner.state = SessionState::Disconnected;
            (
                inner
                    .link
                    .take(),
                inner
                    .port
                    .take(),
            )
        };
        *lock(&self.cache) = DeviceCache::default();

        if let Some(link) = link {
            link.close();
            let port = port.unwrap_or_default();
            info!("Disconnected from {port}");
            self.events
                .emit(&DeviceEvent::ConnectionChanged {
                    port,
                    connected: false,
                });
        }
    }

    /// Set the LED color on the zones in `leds`.
    pub fn set_color(&self, color: Rgb, leds: LedMask) -> Result<()> {
        self.run(&Request::set_color(color, leds), &Expect::ack())
            .map(drop)
    }

    /// Play a custom LED pattern.
    ///
    /// `looping` repeats it until replaced; `priority` plays it once over
    /// whatever pattern is active.
    pub fn set_pattern(&self, steps: &[PatternStep], looping: bool, priority: bool) -> Result<()> {
        let link = self.link()?;
        if steps.is_empty() {
            return Err(Error::InvalidArgument("pattern has no steps".into()));
        }
        self.execute_on(
            &link,
            &Request::custom_pattern(steps, looping, priority),
            &Expect::ack(),
            self.config.command_timeout,
        )
        .map(drop)
    }

    /// Query the display brightness, 0-100.
    pub fn get_brightness(&self) -> Result<u8> {
        let resp = self.run(&Request::get_brightness(), &Expect::data(tag::BRIGHTNESS))?;
        let value = resp.require_u64(tag::BRIGHTNESS)?;
        let level = u8::try_from(value)
            .ok()
            .filter(|l| *l <= MAX_BRIGHTNESS)
            .ok_or_else(|| Error::ProtocolViolation(format!("brightness {value} out of range")))?;
        lock(&self.cache).brightness = Some(level);
        Ok(level)
    }

    /// Set the display brightness, 0-100.
    pub fn set_brightness(&self, level: u8) -> Result<()> {
        let link = self.link()?;
        if level > MAX_BRIGHTNESS {
            return Err(Error::InvalidArgument(format!(
                "brightness {level} out of range 0-{MAX_BRIGHTNESS}"
            )));
        }
        self.execute_on(
            &link,
            &Request::set_brightness(level),
            &Expect::ack(),
            self.config.command_timeout,
        )?;
        lock(&self.cache).brightness = Some(level);
        Ok(())
    }

    /// Brightness from the last get or set.
    pub fn cached_brightness(&self) -> Option<u8> {
        lock(&self.cache).brightness
    }

    /// List the files in device storage.
    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        let resp = self.run(&Request::list_files(), &Expect::data(tag::FILE))?;
        let files = resp
            .fields(tag::FILE)
            .map(|value| parse_file_entry(value).map(|(name, size)| FileEntry { name, size }))
            .collect::<Result<Vec<_>>>();
        let files = match files {
            Ok(files) => files,
            Err(e) => return Err(self.fault_current(e)),
        };
        debug!("Device holds {} files", files.len());
        lock(&self.cache).files = Some(files.clone());
        Ok(files)
    }

    /// File list from the last successful listing.
    pub fn cached_files(&self) -> Option<Vec<FileEntry>> {
        lock(&self.cache)
            .files
            .clone()
    }

    /// Delete a file from device storage.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let link = self.link()?;
        validate_file_name(name)?;
        self.execute_on(
            &link,
            &Request::delete_file(name),
            &Expect::ack(),
            self.config.command_timeout,
        )?;
        let mut cache = lock(&self.cache);
        if let Some(files) = cache
            .files
            .as_mut()
        {
            files.retain(|f| f.name != name);
        }
        cache.storage.free = None;
        Ok(())
    }

    /// Query free storage in bytes.
    pub fn get_free_storage(&self) -> Result<u64> {
        let resp = self.run(&Request::free_storage(), &Expect::data(tag::FREE_STORAGE))?;
        let free = self.numeric(&resp, tag::FREE_STORAGE)?;
        lock(&self.cache)
            .storage
            .free = Some(free);
        Ok(free)
    }

    /// Query total storage in bytes.
    pub fn get_total_storage(&self) -> Result<u64> {
        let resp = self.run(&Request::total_storage(), &Expect::data(tag::TOTAL_STORAGE))?;
        let total = self.numeric(&resp, tag::TOTAL_STORAGE)?;
        lock(&self.cache)
            .storage
            .total = Some(total);
        Ok(total)
    }

    /// Query both storage figures.
    pub fn get_storage(&self) -> Result<StorageInfo> {
        let total = self.get_total_storage()?;
        let free = self.get_free_storage()?;
        Ok(StorageInfo {
            total: Some(total),
            free: Some(free),
        })
    }

    /// Storage figures from the last queries.
    pub fn cached_storage(&self) -> StorageInfo {
        lock(&self.cache).storage
    }

    /// Ask the device to display a stored file.
    ///
    /// The device confirms with a `NowDisplaying` push, which updates
    /// [`current_image_name`](Self::current_image_name).
    pub fn show_picture(&self, name: &str) -> Result<()> {
        let link = self.link()?;
        validate_file_name(name)?;
        self.execute_on(
            &link,
            &Request::show_picture(name),
            &Expect::ack(),
            self.config.command_timeout,
        )
        .map(drop)
    }

    /// Query which file the device is displaying.
    pub fn get_current_image(&self) -> Result<Option<String>> {
        let resp = self.run(&Request::current_picture(), &Expect::data(tag::SHOWING))?;
        let name = resp
            .field(tag::SHOWING)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        lock(&self.cache)
            .current_image
            .clone_from(&name);
        Ok(name)
    }

    /// Image the device last reported as displayed.
    pub fn current_image_name(&self) -> Option<String> {
        lock(&self.cache)
            .current_image
            .clone()
    }

    /// Restart the device.
    ///
    /// The session stays connected; the caller decides whether to disconnect
    /// and reconnect once the device is back.
    pub fn restart(&self) -> Result<()> {
        self.run(&Request::restart(), &Expect::ack())
            .map(drop)
    }

    /// Erase all files from device storage.
    pub fn format_disk(&self) -> Result<()> {
        let link = self.link()?;
        warn!("Formatting device storage");
        self.execute_on(
            &link,
            &Request::format_disk(),
            &Expect::ack(),
            self.config.format_timeout,
        )?;
        let mut cache = lock(&self.cache);
        cache.files = None;
        cache.storage.free = None;
        cache.current_image = None;
        Ok(())
    }

    /// Ask the device to rescan storage and flash a firmware image if one is
    /// present. Progress arrives as `FirmwareUpdateProgress` events.
    pub fn activate_storage_scan(&self) -> Result<()> {
        self.run(&Request::activate_storage_scan(), &Expect::ack())
            .map(drop)
    }

    /// Read and route device pushes for up to `wait` while idle.
    pub fn pump_events(&self, wait: Duration) -> Result<usize> {
        let link = self.link()?;
        link.pump_unsolicited(wait)
            .inspect_err(|e| self.on_error(&link, e))
    }

    /// Upload `size` bytes from `source` as `name`.
    ///
    /// At most `size` bytes are read from `source`.
    pub fn upload<R: Read>(&self, name: &str, mut source: R, size: u64) -> Result<()> {
        let link = self.begin_transfer()?;
        let result = validate_file_name(name).and_then(|()| {
            self.transfer(&link)
                .upload(name, &mut source, size)
        });
        self.end_transfer(&link, result.as_ref().err());

        let mut cache = lock(&self.cache);
        cache.storage.free = None;
        if result.is_ok() {
            cache.files = None;
        }
        result
    }

    /// Download `name` into `sink`. Returns the number of bytes written.
    pub fn download<W: Write>(&self, name: &str, mut sink: W) -> Result<u64> {
        let link = self.begin_transfer()?;
        let result = validate_file_name(name).and_then(|()| {
            self.transfer(&link)
                .download(name, &mut sink)
        });
        self.end_transfer(&link, result.as_ref().err());
        result
    }

    /// Download `name` into memory.
    pub fn download_to_vec(&self, name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.download(name, &mut data)?;
        Ok(data)
    }

    /// Ask the running transfer to stop. Returns whether one was running.
    ///
    /// The transfer returns [`Error::TransferAborted`] after at most one more
    /// chunk exchange, and the session is back to Connected within one
    /// transfer `chunk_timeout`.
    pub fn cancel_transfer(&self) -> bool {
        if self.state() != SessionState::Busy {
            return false;
        }
        info!("Cancelling transfer");
        self.cancel
            .store(true, Ordering::SeqCst);
        true
    }

    fn transfer<'a>(&'a self, link: &'a Dispatcher) -> Transfer<'a> {
        Transfer {
            link,
            config: &self.config.transfer,
            events: &self.events,
            cancel: &self.cancel,
        }
    }

    fn push_sink(&self) -> UnsolicitedSink {
        let cache = Arc::clone(&self.cache);
        let events = Arc::clone(&self.events);
        Arc::new(move |push: Unsolicited| {
            if let Unsolicited::NowDisplaying(name) = &push {
                lock(&cache).current_image = Some(name.clone());
            }
            events.emit(&DeviceEvent::from(push));
        })
    }

    fn handshake(&self, link: &Dispatcher) -> Result<DeviceIdentity> {
        let timeout = self.config.handshake_timeout;
        let query = |request: Request, field: &'static str| -> Result<String> {
            link.execute(&request, &Expect::data(field), timeout)?
                .require(field)
                .map(str::to_string)
        };
        Ok(DeviceIdentity {
            name: query(Request::device_name(), tag::DEVICE_NAME)?,
            manufacturer: query(Request::manufacturer(), tag::MANUFACTURER)?,
            id: query(Request::device_id(), tag::DEVICE_ID)?,
            firmware_version: query(Request::firmware_version(), tag::FIRMWARE)?,
        })
    }

    fn abandon_connect(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Connecting {
            inner.state = SessionState::Disconnected;
            inner.port = None;
        }
    }

    /// The live dispatcher, if typed commands are currently allowed.
    fn link(&self) -> Result<Arc<Dispatcher>> {
        let inner = lock(&self.inner);
        match (inner.state, &inner.link) {
            (SessionState::Connected, Some(link)) => Ok(Arc::clone(link)),
            (SessionState::Busy, _) => Err(Error::SessionBusy),
            _ => Err(Error::NotConnected),
        }
    }

    fn run(&self, request: &Request, matcher: &dyn ResponseMatcher) -> Result<Response> {
        let link = self.link()?;
        self.execute_on(&link, request, matcher, self.config.command_timeout)
    }

    fn execute_on(
        &self,
        link: &Arc<Dispatcher>,
        request: &Request,
        matcher: &dyn ResponseMatcher,
        timeout: Duration,
    ) -> Result<Response> {
        link.execute(request, matcher, timeout)
            .inspect_err(|e| self.on_error(link, e))
    }

    fn numeric(&self, resp: &Response, field: &str) -> Result<u64> {
        resp.require_u64(field)
            .map_err(|e| self.fault_current(e))
    }

    /// Tear down the current link for a malformed response found after the
    /// dispatcher already returned.
    fn fault_current(&self, err: Error) -> Error {
        let link = lock(&self.inner)
            .link
            .clone();
        if let Some(link) = link {
            self.on_error(&link, &err);
        }
        err
    }

    fn on_error(&self, link: &Arc<Dispatcher>, err: &Error) {
        if err.is_link_fault() {
            self.fault(link, err);
        }
    }

    /// Faulted -> Disconnected, if `link` is still the live one.
    fn fault(&self, link: &Arc<Dispatcher>, err: &Error) {
        let port = {
            let mut inner = lock(&self.inner);
            let current = inner
                .link
                .as_ref()
                .is_some_and(|l| Arc::ptr_eq(l, link));
            if !current {
                return;
            }
            warn!("Link fault: {err}");
            inner.state = SessionState::Faulted;
            inner.link = None;
            inner
                .port
                .take()
                .unwrap_or_default()
        };

        link.close();
        *lock(&self.cache) = DeviceCache::default();
        lock(&self.inner).state = SessionState::Disconnected;
        info!("Disconnected from {port} after link fault");
        self.events
            .emit(&DeviceEvent::ConnectionChanged {
                port,
                connected: false,
            });
    }

    fn begin_transfer(&self) -> Result<Arc<Dispatcher>> {
        let mut inner = lock(&self.inner);
        let link = match (inner.state, &inner.link) {
            (SessionState::Connected, Some(link)) => Arc::clone(link),
            (SessionState::Busy, _) => return Err(Error::SessionBusy),
            _ => return Err(Error::NotConnected),
        };
        inner.state = SessionState::Busy;
        self.cancel
            .store(false, Ordering::SeqCst);
        Ok(link)
    }

    fn end_transfer(&self, link: &Arc<Dispatcher>, err: Option<&Error>) {
        if let Some(err) = err {
            if err.is_link_fault() {
                self.fault(link, err);
                return;
            }
        }
        let mut inner = lock(&self.inner);
        let current = inner
            .link
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(l, link));
        if current && inner.state == SessionState::Busy {
            inner.state = SessionState::Connected;
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("DeviceSession")
            .field("state", &inner.state)
            .field("port", &inner.port)
            .finish_non_exhaustive()
    }
}
