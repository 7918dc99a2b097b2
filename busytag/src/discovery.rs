//! Periodic, deduplicated device discovery.
//!
//! Each scan enumerates serial ports, asks every candidate for its device
//! name and keeps the ports whose name carries the device prefix. Listeners
//! hear about the result only when it matters:
//!
//! | previous | new          | notify                                   |
//! |----------|--------------|------------------------------------------|
//! | any      | different    | now                                      |
//! | `S`      | `S` nonempty | once the quiet interval has elapsed      |
//! | empty    | empty        | never                                    |

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{Listeners, SubscriptionId};
use crate::port::{Connector, DEFAULT_BAUD, PortEnumerator, PortInfo, SerialConfig};
use crate::protocol::{Expect, Request, tag};
use crate::transport::Transport;
use log::{debug, info, trace, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Name prefix reported by BusyTag devices.
pub const DEFAULT_DEVICE_PREFIX: &str = "busytag-";

/// Default scan interval for periodic search.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Discovery tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Device name prefix that identifies the target device.
    pub device_prefix: String,
    /// Deadline for the identity probe on each port.
    pub probe_timeout: Duration,
    /// Minimum time between repeated notifications of an unchanged set.
    pub quiet_interval: Duration,
    /// Baud rate used for probing.
    pub baud_rate: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            probe_timeout: Duration::from_millis(500),
            quiet_interval: Duration::from_secs(30),
            baud_rate: DEFAULT_BAUD,
        }
    }
}

/// Decides whether a scan result is worth announcing.
#[derive(Debug, Clone)]
pub struct ChangeGate {
    quiet_interval: Duration,
    current: BTreeSet<String>,
    last_notified: Option<Instant>,
}

impl ChangeGate {
    /// Gate starting from an empty set.
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            current: BTreeSet::new(),
            last_notified: None,
        }
    }

    /// The last set offered.
    pub fn current(&self) -> &BTreeSet<String> {
        &self.current
    }

    /// Offer a new scan result observed at `now`. Returns whether to notify.
    pub fn offer(&mut self, snapshot: BTreeSet<String>, now: Instant) -> bool {
        let notify = if snapshot != self.current {
            self.current = snapshot;
            true
        } else if self
            .current
            .is_empty()
        {
            false
        } else {
            self.last_notified
                .is_none_or(|at| now.saturating_duration_since(at) > self.quiet_interval)
        };

        if notify {
            self.last_notified = Some(now);
        }
        notify
    }
}

#[derive(Debug)]
struct ScanState {
    gate: ChangeGate,
    /// Ports that answered but are not the target device.
    known_invalid: HashSet<String>,
    /// Ports held open by a session in this process.
    claimed: HashSet<String>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    enumerator: Arc<dyn PortEnumerator>,
    config: DiscoveryConfig,
    state: Mutex<ScanState>,
    listeners: Listeners<[String]>,
    scanning: Mutex<()>,
}

enum Probe {
    Device(String),
    Foreign,
    Unreachable,
}

impl Shared {
    fn scan(&self) -> Result<Vec<String>> {
        let _scanning = lock(&self.scanning);

        let ports = self
            .enumerator
            .list_ports()?;
        let present: HashSet<&str> = ports
            .iter()
            .map(|p| p.name.as_str())
            .collect();

        let (claimed, known_invalid) = {
            let mut state = lock(&self.state);
            state
                .known_invalid
                .retain(|p| present.contains(p.as_str()));
            (state.claimed.clone(), state.known_invalid.clone())
        };

        let mut found = BTreeSet::new();
        let mut invalid = Vec::new();
        for port in &ports {
            if claimed.contains(&port.name) {
                trace!("{} is held by a session", port.name);
                found.insert(port.name.clone());
                continue;
            }
            if known_invalid.contains(&port.name) {
                continue;
            }
            match self.probe(port) {
                Probe::Device(name) => {
                    debug!("Found {name} on {}", port.name);
                    found.insert(port.name.clone());
                },
                Probe::Foreign => invalid.push(port.name.clone()),
                Probe::Unreachable => {},
            }
        }

        let snapshot: Vec<String> = found
            .iter()
            .cloned()
            .collect();
        let notify = {
            let mut state = lock(&self.state);
            state
                .known_invalid
                .extend(invalid);
            state
                .gate
                .offer(found, Instant::now())
        };

        if notify {
            info!("Devices: {snapshot:?}");
            self.listeners
                .notify(&snapshot);
        }
        Ok(snapshot)
    }

    fn probe(&self, port: &PortInfo) -> Probe {
        if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            trace!("Probing {} (VID: {vid:04X}, PID: {pid:04X})", port.name);
        } else {
            trace!("Probing {}", port.name);
        }

        let serial = SerialConfig::new(&port.name).with_baud(self.config.baud_rate);
        let transport = match Transport::open(self.connector.as_ref(), &serial) {
            Ok(t) => t,
            Err(e) => {
                debug!("Skipping {}: {e}", port.name);
                return Probe::Unreachable;
            },
        };
        let link = Dispatcher::new(transport, None);
        let result = link.execute(
            &Request::device_name(),
            &Expect::data(tag::DEVICE_NAME),
            self.config.probe_timeout,
        );
        link.close();

        match result {
            Ok(resp) => match resp.field(tag::DEVICE_NAME) {
                Some(name) if name.starts_with(&self.config.device_prefix) => {
                    Probe::Device(name.to_string())
                },
                other => {
                    debug!("{} is not a device: name {other:?}", port.name);
                    Probe::Foreign
                },
            },
            Err(Error::CommandRejected { .. }) => {
                debug!("{} refused the identity query", port.name);
                Probe::Foreign
            },
            Err(Error::ProtocolViolation(line)) => {
                debug!("{} answered something else: {line}", port.name);
                Probe::Foreign
            },
            Err(e) => {
                debug!("No answer from {}: {e}", port.name);
                Probe::Unreachable
            },
        }
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Finds attached devices, once or on a timer thread.
pub struct DiscoveryManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DiscoveryManager {
    /// Create a manager using the given port access.
    pub fn new(
        connector: Arc<dyn Connector>,
        enumerator: Arc<dyn PortEnumerator>,
        config: DiscoveryConfig,
    ) -> Self {
        let gate = ChangeGate::new(config.quiet_interval);
        Self {
            shared: Arc::new(Shared {
                connector,
                enumerator,
                config,
                state: Mutex::new(ScanState {
                    gate,
                    known_invalid: HashSet::new(),
                    claimed: HashSet::new(),
                }),
                listeners: Listeners::default(),
                scanning: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Create a manager on the operating system's serial ports.
    #[cfg(feature = "native")]
    pub fn native(config: DiscoveryConfig) -> Self {
        Self::new(
            Arc::new(crate::port::NativeConnector),
            Arc::new(crate::port::NativePortEnumerator),
            config,
        )
    }

    /// Register a listener for "devices changed" notifications.
    ///
    /// The listener receives the sorted list of device ports. It runs on the
    /// scanning thread.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .subscribe(listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared
            .listeners
            .unsubscribe(id)
    }

    /// Run one scan now and return the device ports found.
    pub fn scan_once(&self) -> Result<Vec<String>> {
        self.shared
            .scan()
    }

    /// Device ports found by the last scan.
    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.shared.state)
            .gate
            .current()
            .iter()
            .cloned()
            .collect()
    }

    /// Ports skipped because they answered as some other device.
    pub fn known_invalid_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.shared.state)
            .known_invalid
            .iter()
            .cloned()
            .collect();
        ports.sort();
        ports
    }

    /// Report `port` as present without probing it, while a session holds it.
    pub fn claim_port(&self, port: &str) {
        lock(&self.shared.state)
            .claimed
            .insert(port.to_string());
    }

    /// Undo [`claim_port`](Self::claim_port).
    pub fn release_port(&self, port: &str) {
        lock(&self.shared.state)
            .claimed
            .remove(port);
    }

    /// Whether the periodic search thread is running.
    pub fn is_searching(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Scan immediately and then every `interval` until stopped.
    ///
    /// Does nothing if a search is already running.
    pub fn start_periodic_search(&self, interval: Duration) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!("Periodic search already running");
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("busytag-discovery".into())
            .spawn(move || {
                loop {
                    if let Err(e) = shared.scan() {
                        warn!("Port scan failed: {e}");
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {},
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Periodic search stopped");
            })?;

        info!("Searching for devices every {} ms", interval.as_millis());
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stop the periodic search and wait for the thread to exit. Idempotent.
    pub fn stop_periodic_search(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        let _ = worker
            .stop
            .send(());
        if worker
            .handle
            .join()
            .is_err()
        {
            warn!("Discovery thread panicked");
        }
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        self.stop_periodic_search();
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("config", &self.shared.config)
            .field("searching", &self.is_searching())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockDevice, MockEnumerator, init_logger};

    fn set(ports: &[&str]) -> BTreeSet<String> {
        ports
            .iter()
            .map(|p| (*p).to_string())
            .collect()
    }

    #[test]
    fn test_gate_first_scan() {
        let t0 = Instant::now();
        let mut gate = ChangeGate::new(Duration::from_secs(30));
        assert!(!gate.offer(set(&[]), t0));

        let mut gate = ChangeGate::new(Duration::from_secs(30));
        assert!(gate.offer(set(&["COM3"]), t0));
    }

    #[test]
    fn test_gate_suppresses_repeats_until_quiet_interval() {
        let t0 = Instant::now();
        let mut gate = ChangeGate::new(Duration::from_secs(30));
        assert!(gate.offer(set(&["COM3", "COM4"]), t0));
        // Order does not matter
        assert!(!gate.offer(set(&["COM4", "COM3"]), t0 + Duration::from_secs(10)));
        assert!(!gate.offer(set(&["COM3", "COM4"]), t0 + Duration::from_secs(30)));
        assert!(gate.offer(set(&["COM3", "COM4"]), t0 + Duration::from_secs(31)));
        assert!(!gate.offer(set(&["COM3", "COM4"]), t0 + Duration::from_secs(40)));
    }

    #[test]
    fn test_gate_change_and_empty() {
        let t0 = Instant::now();
        let mut gate = ChangeGate::new(Duration::from_secs(30));
        assert!(gate.offer(set(&["COM3"]), t0));
        assert!(gate.offer(set(&["COM3", "COM5"]), t0 + Duration::from_secs(1)));
        // Unplugged: announced once
        assert!(gate.offer(set(&[]), t0 + Duration::from_secs(2)));
        assert!(!gate.offer(set(&[]), t0 + Duration::from_secs(100)));
        assert!(gate.current().is_empty());
    }

    struct Rig {
        connector: Arc<MockConnector>,
        enumerator: Arc<MockEnumerator>,
        manager: DiscoveryManager,
        notified: Arc<Mutex<Vec<Vec<String>>>>,
    }

    fn rig() -> Rig {
        init_logger();
        let connector = Arc::new(MockConnector::new());
        let enumerator = Arc::new(MockEnumerator::new());
        let config = DiscoveryConfig {
            probe_timeout: Duration::from_millis(50),
            ..DiscoveryConfig::default()
        };
        let manager = DiscoveryManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&enumerator) as Arc<dyn PortEnumerator>,
            config,
        );
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        manager.subscribe(move |ports| sink.lock().unwrap().push(ports.to_vec()));
        Rig {
            connector,
            enumerator,
            manager,
            notified,
        }
    }

    #[test]
    fn test_scan_classifies_ports() {
        let rig = rig();
        let device = MockDevice::new("busytag-3C84");
        let other = MockDevice::new("esp32-devkit");
        let silent = MockDevice::new("busytag-mute");
        silent.mute_all();
        rig.connector
            .attach("/dev/ttyACM0", &device);
        rig.connector
            .attach("/dev/ttyACM1", &other);
        rig.connector
            .attach("/dev/ttyACM2", &silent);
        rig.enumerator
            .set_ports(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2", "/dev/ttyUSB9"]);

        let found = rig
            .manager
            .scan_once()
            .unwrap();
        assert_eq!(found, vec!["/dev/ttyACM0"]);
        assert_eq!(rig.manager.snapshot(), found);
        assert_eq!(rig.manager.known_invalid_ports(), vec!["/dev/ttyACM1"]);
        assert_eq!(*rig.notified.lock().unwrap(), vec![found.clone()]);

        // Known-invalid ports are not probed again; silent ones are
        rig.manager
            .scan_once()
            .unwrap();
        assert_eq!(other.count("AT+GDN"), 1);
        assert_eq!(silent.count("AT+GDN"), 2);
        assert_eq!(rig.notified.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_garbage_answer_marks_port_invalid() {
        let rig = rig();
        let noisy = MockDevice::new("busytag-noisy");
        noisy.interleave("AT+GDN", "~~garbage~~");
        rig.connector
            .attach("COM9", &noisy);
        rig.enumerator
            .set_ports(&["COM9"]);

        assert!(rig.manager.scan_once().unwrap().is_empty());
        assert_eq!(rig.manager.known_invalid_ports(), vec!["COM9"]);

        rig.manager
            .scan_once()
            .unwrap();
        assert_eq!(noisy.count("AT+GDN"), 1);
        assert_eq!(noisy.opens(), 1);
    }

    #[test]
    fn test_known_invalid_forgotten_when_port_vanishes() {
        let rig = rig();
        let other = MockDevice::new("modem");
        rig.connector
            .attach("COM7", &other);
        rig.enumerator
            .set_ports(&["COM7"]);
        rig.manager
            .scan_once()
            .unwrap();
        assert_eq!(rig.manager.known_invalid_ports(), vec!["COM7"]);

        rig.enumerator
            .set_ports(&[]);
        rig.manager
            .scan_once()
            .unwrap();
        assert!(rig.manager.known_invalid_ports().is_empty());

        // A busytag now appears on the same port name
        let device = MockDevice::new("busytag-1");
        rig.connector
            .attach("COM7", &device);
        rig.enumerator
            .set_ports(&["COM7"]);
        assert_eq!(rig.manager.scan_once().unwrap(), vec!["COM7"]);
    }

    #[test]
    fn test_first_empty_scan_is_silent_and_unplug_is_announced() {
        let rig = rig();
        rig.manager
            .scan_once()
            .unwrap();
        assert!(rig.notified.lock().unwrap().is_empty());

        let device = MockDevice::new("busytag-1");
        rig.connector
            .attach("COM3", &device);
        rig.enumerator
            .set_ports(&["COM3"]);
        rig.manager
            .scan_once()
            .unwrap();

        rig.connector
            .detach("COM3");
        rig.enumerator
            .set_ports(&[]);
        rig.manager
            .scan_once()
            .unwrap();
        rig.manager
            .scan_once()
            .unwrap();

        assert_eq!(
            *rig.notified.lock().unwrap(),
            vec![vec!["COM3".to_string()], Vec::new()]
        );
    }

    #[test]
    fn test_claimed_port_is_not_probed() {
        let rig = rig();
        let device = MockDevice::new("busytag-1");
        rig.connector
            .attach("COM3", &device);
        rig.enumerator
            .set_ports(&["COM3"]);

        rig.manager
            .claim_port("COM3");
        assert_eq!(rig.manager.scan_once().unwrap(), vec!["COM3"]);
        assert_eq!(device.opens(), 0);

        rig.manager
            .release_port("COM3");
        rig.manager
            .scan_once()
            .unwrap();
        assert_eq!(device.opens(), 1);
    }

    #[test]
    fn test_periodic_search() {
        let rig = rig();
        let device = MockDevice::new("busytag-1");
        rig.connector
            .attach("COM3", &device);
        rig.enumerator
            .set_ports(&["COM3"]);

        assert!(!rig.manager.is_searching());
        rig.manager
            .start_periodic_search(Duration::from_millis(10))
            .unwrap();
        rig.manager
            .start_periodic_search(Duration::from_millis(10))
            .unwrap();
        assert!(rig.manager.is_searching());

        let deadline = Instant::now() + Duration::from_secs(2);
        while device.count("AT+GDN") < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        rig.manager
            .stop_periodic_search();
        rig.manager
            .stop_periodic_search();
        assert!(!rig.manager.is_searching());
        assert!(device.count("AT+GDN") >= 3);

        // Repeats inside the quiet interval were suppressed
        assert_eq!(rig.notified.lock().unwrap().len(), 1);
    }
}
