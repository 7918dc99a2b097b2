//! Scripted in-memory BusyTag used by the unit tests.
//!
//! [`MockDevice`] emulates the device side of the AT protocol, including
//! chunked upload and download, and can be told to stay silent, refuse,
//! delay or corrupt specific commands.

use crate::error::{Error, Result};
use crate::port::{Connector, Port, PortEnumerator, PortInfo, SerialConfig};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

struct Upload {
    name: String,
    size: usize,
    data: Vec<u8>,
}

struct DeviceState {
    name: String,
    manufacturer: String,
    id: String,
    firmware: String,
    brightness: u8,
    files: BTreeMap<String, Vec<u8>>,
    total_storage: u64,
    showing: String,
    download_chunk: usize,

    muted: HashSet<String>,
    mute_all: bool,
    mute_after: HashMap<String, usize>,
    rejected: HashMap<String, Option<String>>,
    reject_after: HashMap<String, (usize, Option<String>)>,
    delays: HashMap<String, Duration>,
    interleave: HashMap<String, String>,
    link_failed: bool,

    to_host: VecDeque<(Instant, u8)>,
    parse_buf: Vec<u8>,
    pending_payload: Option<(String, usize)>,
    received: Vec<String>,
    raw: Vec<u8>,
    seen: HashMap<String, usize>,
    upload: Option<Upload>,
    download: Option<(Vec<u8>, usize)>,
    opens: usize,
}

fn key_of(line: &str) -> &str {
    line.split('=')
        .next()
        .unwrap_or(line)
}

impl DeviceState {
    fn used(&self) -> u64 {
        self.files
            .values()
            .map(|f| f.len() as u64)
            .sum()
    }

    fn enqueue(&mut self, bytes: &[u8], delay: Duration) {
        let ready = Instant::now() + delay;
        self.to_host
            .extend(bytes.iter().map(|&b| (ready, b)));
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.raw
            .extend_from_slice(bytes);
        self.parse_buf
            .extend_from_slice(bytes);

        loop {
            if let Some((line, len)) = self
                .pending_payload
                .take()
            {
                if self.parse_buf.len() < len {
                    self.pending_payload = Some((line, len));
                    return;
                }
                let payload: Vec<u8> = self
                    .parse_buf
                    .drain(..len)
                    .collect();
                self.handle(&line, payload);
                continue;
            }

            let Some(pos) = self
                .parse_buf
                .iter()
                .position(|&b| b == b'\n')
            else {
                return;
            };
            let raw: Vec<u8> = self
                .parse_buf
                .drain(..=pos)
                .collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end()
                .to_string();
            self.received
                .push(line.clone());

            match line
                .strip_prefix("AT+UC=")
                .and_then(|n| n.parse::<usize>().ok())
            {
                Some(len) => self.pending_payload = Some((line, len)),
                None => self.handle(&line, Vec::new()),
            }
        }
    }

    fn handle(&mut self, line: &str, payload: Vec<u8>) {
        let key = key_of(line).to_string();
        let count = {
            let c = self
                .seen
                .entry(key.clone())
                .or_insert(0);
            *c += 1;
            *c
        };

        if self.mute_all
            || self
                .muted
                .contains(&key)
            || self
                .mute_after
                .get(&key)
                .is_some_and(|&n| count > n)
        {
            return;
        }

        let delay = self
            .delays
            .get(&key)
            .copied()
            .unwrap_or_default();
        let mut out = Vec::new();
        if let Some(push) = self
            .interleave
            .remove(&key)
        {
            out.extend_from_slice(format!("{push}\r\n").as_bytes());
        }

        let refusal = self
            .rejected
            .get(&key)
            .cloned()
            .or_else(|| {
                self.reject_after
                    .get(&key)
                    .filter(|(n, _)| count > *n)
                    .map(|(_, r)| r.clone())
            });
        if let Some(reason) = refusal {
            match reason {
                Some(r) => out.extend_from_slice(format!("ERROR:{r}\r\n").as_bytes()),
                None => out.extend_from_slice(b"ERROR\r\n"),
            }
            self.enqueue(&out, delay);
            return;
        }

        let arg = line
            .split_once('=')
            .map(|(_, a)| a.to_string())
            .unwrap_or_default();
        self.respond(&key, &arg, payload, &mut out);
        self.enqueue(&out, delay);
    }

    fn respond(&mut self, key: &str, arg: &str, payload: Vec<u8>, out: &mut Vec<u8>) {
        let mut line = |s: &str| {
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        };

        match key {
            "AT+GDN" => line(&format!("+DN:{}", self.name)),
            "AT+GMN" => line(&format!("+MN:{}", self.manufacturer)),
            "AT+GID" => line(&format!("+ID:{}", self.id)),
            "AT+GFV" => line(&format!("+FV:{}", self.firmware)),
            "AT+SC" | "AT+CP" | "AT+RST" | "AT+UA" | "AT+GA" => {
                if key == "AT+UA" {
                    self.upload = None;
                }
                if key == "AT+GA" {
                    self.download = None;
                }
            },
            "AT+GDB" => line(&format!("+DB:{}", self.brightness)),
            "AT+SDB" => match arg.parse::<u8>() {
                Ok(level) if level <= 100 => self.brightness = level,
                _ => {
                    line("ERROR:RANGE");
                    return;
                },
            },
            "AT+GFL" => {
                for (name, data) in &self.files {
                    line(&format!("+FL:{name},{}", data.len()));
                }
            },
            "AT+DF" => {
                if self
                    .files
                    .remove(arg)
                    .is_none()
                {
                    line("ERROR:NOT_FOUND");
                    return;
                }
            },
            "AT+GFSS" => line(&format!("+FSS:{}", self.total_storage - self.used())),
            "AT+GTSS" => line(&format!("+TSS:{}", self.total_storage)),
            "AT+SP" => {
                if !self
                    .files
                    .contains_key(arg)
                {
                    line("ERROR:NOT_FOUND");
                    return;
                }
                self.showing = arg.to_string();
                line("OK");
                line(&format!("+SP:{arg}"));
                return;
            },
            "AT+GSP" => line(&format!("+SP:{}", self.showing)),
            "AT+FD" => {
                self.files
                    .clear();
                self.showing
                    .clear();
            },
            "AT+AFSS" => {
                let has_firmware = self
                    .files
                    .keys()
                    .any(|n| n.ends_with(".bin"));
                line("OK");
                if has_firmware {
                    for p in [0, 50, 100] {
                        line(&format!("+FUS:{p}"));
                    }
                }
                return;
            },
            "AT+UF" => {
                let Some((name, size)) = arg
                    .rsplit_once(',')
                    .and_then(|(n, s)| Some((n.to_string(), s.parse::<usize>().ok()?)))
                else {
                    line("ERROR:ARGS");
                    return;
                };
                if size as u64 > self.total_storage - self.used() {
                    line("ERROR:NO_SPACE");
                    return;
                }
                self.upload = Some(Upload {
                    name,
                    size,
                    data: Vec::new(),
                });
            },
            "AT+UC" => {
                let Some(upload) = self
                    .upload
                    .as_mut()
                else {
                    line("ERROR:NO_TRANSFER");
                    return;
                };
                upload
                    .data
                    .extend_from_slice(&payload);
                let received = upload.data.len();
                line(&format!("+UC:{received}"));
            },
            "AT+UE" => match self
                .upload
                .take()
            {
                Some(upload) if upload.data.len() == upload.size => {
                    self.files
                        .insert(upload.name, upload.data);
                },
                _ => {
                    line("ERROR:INCOMPLETE");
                    return;
                },
            },
            "AT+GF" => {
                let Some(data) = self
                    .files
                    .get(arg)
                    .cloned()
                else {
                    line("ERROR:NOT_FOUND");
                    return;
                };
                line(&format!("+GF:{}", data.len()));
                self.download = Some((data, 0));
            },
            "AT+GC" => {
                let Some((data, offset)) = self
                    .download
                    .as_mut()
                else {
                    line("ERROR:NO_TRANSFER");
                    return;
                };
                let end = (*offset + self.download_chunk).min(data.len());
                let segment = data[*offset..end].to_vec();
                *offset = end;
                if segment.is_empty() {
                    self.download = None;
                }
                line(&format!("+GC:{}", segment.len()));
                out.extend_from_slice(&segment);
            },
            _ => {
                line("ERROR:UNKNOWN");
                return;
            },
        }
        out.extend_from_slice(b"OK\r\n");
    }
}

/// Handle to an emulated device. Clones share state.
#[derive(Clone)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                name: name.to_string(),
                manufacturer: "Greynut".to_string(),
                id: "3C84279A1B2C".to_string(),
                firmware: "2.0.1".to_string(),
                brightness: 80,
                files: BTreeMap::new(),
                total_storage: 4_000_000,
                showing: String::new(),
                download_chunk: 1024,
                muted: HashSet::new(),
                mute_all: false,
                mute_after: HashMap::new(),
                rejected: HashMap::new(),
                reject_after: HashMap::new(),
                delays: HashMap::new(),
                interleave: HashMap::new(),
                link_failed: false,
                to_host: VecDeque::new(),
                parse_buf: Vec::new(),
                pending_payload: None,
                received: Vec::new(),
                raw: Vec::new(),
                seen: HashMap::new(),
                upload: None,
                download: None,
                opens: 0,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self
            .state
            .lock()
            .unwrap())
    }

    /// Open a port onto this device, named `/dev/mock0`.
    pub(crate) fn port(&self) -> Box<dyn Port> {
        self.port_named("/dev/mock0")
    }

    pub(crate) fn port_named(&self, name: &str) -> Box<dyn Port> {
        self.with(|s| s.opens += 1);
        Box::new(MockPort {
            device: self.clone(),
            name: name.to_string(),
            open: true,
        })
    }

    /// Never answer `cmd`.
    pub(crate) fn mute(&self, cmd: &str) {
        self.with(|s| s.muted.insert(cmd.to_string()));
    }

    /// Never answer anything.
    pub(crate) fn mute_all(&self) {
        self.with(|s| s.mute_all = true);
    }

    /// Answer the first `n` occurrences of `cmd`, then go silent.
    pub(crate) fn mute_after(&self, cmd: &str, n: usize) {
        self.with(|s| s.mute_after.insert(cmd.to_string(), n));
    }

    /// Answer `cmd` with `ERROR[:reason]`.
    pub(crate) fn reject(&self, cmd: &str, reason: Option<&str>) {
        self.with(|s| {
            s.rejected
                .insert(cmd.to_string(), reason.map(str::to_string))
        });
    }

    /// Answer the first `n` occurrences of `cmd`, then refuse.
    pub(crate) fn reject_after(&self, cmd: &str, n: usize, reason: Option<&str>) {
        self.with(|s| {
            s.reject_after
                .insert(cmd.to_string(), (n, reason.map(str::to_string)))
        });
    }

    /// Delay every answer to `cmd`.
    pub(crate) fn delay(&self, cmd: &str, delay: Duration) {
        self.with(|s| s.delays.insert(cmd.to_string(), delay));
    }

    /// Put `line` in front of the next answer to `cmd`.
    pub(crate) fn interleave(&self, cmd: &str, line: &str) {
        self.with(|s| {
            s.interleave
                .insert(cmd.to_string(), line.to_string())
        });
    }

    /// Push a line to the host right away.
    pub(crate) fn push_line(&self, line: &str) {
        self.with(|s| s.enqueue(format!("{line}\r\n").as_bytes(), Duration::ZERO));
    }

    /// Make all port I/O fail as if the cable was pulled.
    pub(crate) fn set_link_failed(&self, failed: bool) {
        self.with(|s| s.link_failed = failed);
    }

    pub(crate) fn add_file(&self, name: &str, data: Vec<u8>) {
        self.with(|s| s.files.insert(name.to_string(), data));
    }

    pub(crate) fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.with(|s| s.files.get(name).cloned())
    }

    pub(crate) fn set_total_storage(&self, bytes: u64) {
        self.with(|s| s.total_storage = bytes);
    }

    pub(crate) fn set_download_chunk(&self, bytes: usize) {
        self.with(|s| s.download_chunk = bytes);
    }

    /// Request lines received so far, in order.
    pub(crate) fn received_lines(&self) -> Vec<String> {
        self.with(|s| s.received.clone())
    }

    /// Every byte the host wrote, in order.
    pub(crate) fn raw_written(&self) -> Vec<u8> {
        self.with(|s| s.raw.clone())
    }

    /// How many times `cmd` was received.
    pub(crate) fn count(&self, cmd: &str) -> usize {
        self.with(|s| s.seen.get(cmd).copied().unwrap_or(0))
    }

    /// How many ports were opened onto this device.
    pub(crate) fn opens(&self) -> usize {
        self.with(|s| s.opens)
    }

    pub(crate) fn clear_log(&self) {
        self.with(|s| {
            s.received.clear();
            s.raw.clear();
            s.seen.clear();
        });
    }
}

struct MockPort {
    device: MockDevice,
    name: String,
    open: bool,
}

impl MockPort {
    fn check(&self) -> std::io::Result<()> {
        if !self.open {
            return Err(std::io::Error::new(ErrorKind::NotConnected, "port closed"));
        }
        if self.device.with(|s| s.link_failed) {
            return Err(std::io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.check()?;
        let n = self.device.with(|s| {
            let now = Instant::now();
            let mut n = 0;
            while n < buf.len() {
                match s.to_host.front() {
                    Some(&(ready, b)) if ready <= now => {
                        buf[n] = b;
                        s.to_host.pop_front();
                        n += 1;
                    },
                    _ => break,
                }
            }
            n
        });
        if n == 0 {
            thread::sleep(Duration::from_millis(1));
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.check()?;
        self.device.with(|s| s.feed(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.check()
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.device.with(|s| s.to_host.clear());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Connector resolving port names to mock devices.
#[derive(Default)]
pub(crate) struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, port: &str, device: &MockDevice) {
        self.devices
            .lock()
            .unwrap()
            .insert(port.to_string(), device.clone());
    }

    pub(crate) fn detach(&self, port: &str) {
        self.devices
            .lock()
            .unwrap()
            .remove(port);
    }
}

impl Connector for MockConnector {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        let devices = self
            .devices
            .lock()
            .unwrap();
        devices
            .get(&config.port_name)
            .map(|d| d.port_named(&config.port_name))
            .ok_or_else(|| Error::PortUnavailable {
                port: config
                    .port_name
                    .clone(),
                reason: "No such file or directory".into(),
            })
    }
}

/// Enumerator returning a settable port list.
#[derive(Default)]
pub(crate) struct MockEnumerator {
    ports: Mutex<Vec<PortInfo>>,
}

impl MockEnumerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_ports(&self, names: &[&str]) {
        *self
            .ports
            .lock()
            .unwrap() = names
            .iter()
            .map(|n| PortInfo {
                vid: Some(0x303A),
                pid: Some(0x81DF),
                ..PortInfo::named(*n)
            })
            .collect();
    }
}

impl PortEnumerator for MockEnumerator {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self
            .ports
            .lock()
            .unwrap()
            .clone())
    }
}
