//! Line-framed transport over a [`Port`].
//!
//! The device speaks CRLF-terminated text lines, with occasional raw binary
//! segments whose length was announced on a preceding line. [`Transport`]
//! buffers incoming bytes so both can be pulled off the same stream.

use crate::error::{Error, Result};
use crate::port::{Connector, Port, SerialConfig};
use log::{debug, trace};
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

/// Line terminator used for requests.
pub const LINE_END: &[u8] = b"\r\n";

/// Upper bound for a single blocking read, so deadlines are honored even if
/// the port timeout is long.
const READ_SLICE: Duration = Duration::from_millis(20);

/// Shortest read attempted when the deadline has already passed.
const MIN_READ: Duration = Duration::from_millis(1);

/// Lines longer than this without a terminator indicate a desynchronized link.
const MAX_LINE_LEN: usize = 4096;

/// One serial connection with line framing.
pub struct Transport {
    port: Option<Box<dyn Port>>,
    name: String,
    rx: Vec<u8>,
}

impl Transport {
    /// Open a transport through `connector`.
    pub fn open(connector: &dyn Connector, config: &SerialConfig) -> Result<Self> {
        let port = connector.open(config)?;
        Ok(Self::from_port(port))
    }

    /// Wrap an already open port.
    pub fn from_port(port: Box<dyn Port>) -> Self {
        let name = port
            .name()
            .to_string();
        Self {
            port: Some(port),
            name,
            rx: Vec::new(),
        }
    }

    /// Port name/path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transport still holds an open port.
    pub fn is_open(&self) -> bool {
        self.port
            .is_some()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn Port>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Link("transport is closed".into()))
    }

    /// Write raw bytes and flush.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes)
            .and_then(|()| port.flush())
            .map_err(|e| Error::link("write failed", &e))
    }

    /// Write one request line followed by CRLF.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("{} <- {line}", self.name);
        let mut frame = Vec::with_capacity(line.len() + LINE_END.len());
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(LINE_END);
        self.send(&frame)
    }

    /// Receive one line (without its terminator).
    ///
    /// At least one read is attempted even with a zero timeout, so this can
    /// also be used to poll.
    pub fn receive_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_line() {
                trace!("{} -> {line}", self.name);
                return Ok(line);
            }
            if self.rx.len() > MAX_LINE_LEN {
                return Err(Error::ProtocolViolation(format!(
                    "unterminated line longer than {MAX_LINE_LEN} bytes"
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = self.fill(remaining.max(MIN_READ))?;
            if read == 0 && Instant::now() >= deadline {
                return Err(Error::CommandTimeout(format!(
                    "no line within {} ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Return a line if one is already available, without waiting.
    pub fn poll_line(&mut self) -> Result<Option<String>> {
        match self.receive_line(Duration::ZERO) {
            Ok(line) => Ok(Some(line)),
            Err(Error::CommandTimeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receive exactly `len` raw bytes.
    pub fn receive_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        while self.rx.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = self.fill(remaining.max(MIN_READ))?;
            if read == 0 && Instant::now() >= deadline {
                return Err(Error::CommandTimeout(format!(
                    "received {} of {len} bytes within {} ms",
                    self.rx.len(),
                    timeout.as_millis()
                )));
            }
        }

        let data: Vec<u8> = self
            .rx
            .drain(..len)
            .collect();
        trace!("{} -> [{} bytes]", self.name, data.len());
        Ok(data)
    }

    /// Discard buffered input, both ours and the port's.
    pub fn clear(&mut self) -> Result<()> {
        self.rx.clear();
        self.port_mut()?
            .clear_buffers()
    }

    /// Close the port. Safe to call repeatedly and after link errors.
    pub fn close(&mut self) {
        self.rx.clear();
        if let Some(mut port) = self
            .port
            .take()
        {
            if let Err(e) = port.close() {
                debug!("Ignoring close error on {}: {e}", self.name);
            }
            debug!("Transport {} closed", self.name);
        }
    }

    /// Read whatever is available within `wait` into the receive buffer.
    fn fill(&mut self, wait: Duration) -> Result<usize> {
        let Some(port) = self
            .port
            .as_mut()
        else {
            return Err(Error::Link("transport is closed".into()));
        };
        port.set_timeout(wait.min(READ_SLICE))?;

        let mut buf = [0u8; 512];
        match port.read(&mut buf) {
            Ok(0) => {
                // Some drivers report "no data" as an empty read
                thread::sleep(MIN_READ);
                Ok(0)
            },
            Ok(n) => {
                self.rx
                    .extend_from_slice(&buf[..n]);
                Ok(n)
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::link(&format!("read from {} failed", self.name), &e)),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self
            .rx
            .iter()
            .position(|&b| b == b'\n')?;
        let mut raw: Vec<u8> = self
            .rx
            .drain(..=pos)
            .collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    /// Mock serial port with separate read/write buffers.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        written: Arc<Mutex<Vec<u8>>>,
        fail_reads: bool,
        closed: Arc<Mutex<u32>>,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                written: Arc::new(Mutex::new(Vec::new())),
                fail_reads: false,
                closed: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.fail_reads {
                return Err(std::io::Error::new(ErrorKind::BrokenPipe, "unplugged"));
            }
            if self.read_buf.is_empty() {
                thread::sleep(Duration::from_millis(1));
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            // Deliver in small pieces to exercise reassembly
            let n = buf.len().min(self.read_buf.len()).min(3);
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockSerial {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(1)
        }
        fn clear_buffers(&mut self) -> Result<()> {
            self.read_buf.clear();
            Ok(())
        }
        fn name(&self) -> &str {
            "mock0"
        }
        fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_receive_lines_strip_terminators() {
        let mut t = Transport::from_port(Box::new(MockSerial::new(b"+DN:busytag-1\r\nOK\n")));
        assert_eq!(t.receive_line(Duration::from_millis(100)).unwrap(), "+DN:busytag-1");
        assert_eq!(t.receive_line(Duration::from_millis(100)).unwrap(), "OK");
    }

    #[test]
    fn test_receive_line_times_out() {
        let mut t = Transport::from_port(Box::new(MockSerial::new(b"partial")));
        let err = t.receive_line(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout(_)));
    }

    #[test]
    fn test_receive_exact_after_line() {
        let mut t = Transport::from_port(Box::new(MockSerial::new(b"+GC:4\r\n\x00\x01\x02\x03OK\r\n")));
        assert_eq!(t.receive_line(Duration::from_millis(100)).unwrap(), "+GC:4");
        assert_eq!(
            t.receive_exact(4, Duration::from_millis(100)).unwrap(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(t.receive_line(Duration::from_millis(100)).unwrap(), "OK");
    }

    #[test]
    fn test_send_line_appends_crlf() {
        let mock = MockSerial::new(b"");
        let written = Arc::clone(&mock.written);
        let mut t = Transport::from_port(Box::new(mock));
        t.send_line("AT+GDN").unwrap();
        assert_eq!(written.lock().unwrap().as_slice(), b"AT+GDN\r\n");
    }

    #[test]
    fn test_read_failure_is_link_error() {
        let mut mock = MockSerial::new(b"");
        mock.fail_reads = true;
        let mut t = Transport::from_port(Box::new(mock));
        let err = t.receive_line(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_link_fault());
    }

    #[test]
    fn test_poll_line_returns_none_when_idle() {
        let mut t = Transport::from_port(Box::new(MockSerial::new(b"")));
        assert!(t.poll_line().unwrap().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockSerial::new(b"");
        let closed = Arc::clone(&mock.closed);
        let mut t = Transport::from_port(Box::new(mock));
        t.close();
        t.close();
        assert!(!t.is_open());
        assert_eq!(*closed.lock().unwrap(), 1);
        assert!(t.send_line("AT").unwrap_err().is_link_fault());
        drop(t);
        assert_eq!(*closed.lock().unwrap(), 1);
    }
}
