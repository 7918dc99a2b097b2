//! Chunked file upload and download.
//!
//! ## Upload
//!
//! ```text
//! AT+UF=<name>,<size>      -> OK | ERROR:<reason>
//! AT+UC=<len> <bytes>      -> +UC:<received> OK     (repeated, one chunk at a time)
//! AT+UE                    -> OK
//! ```
//!
//! ## Download
//!
//! ```text
//! AT+GF=<name>             -> +GF:<size> OK
//! AT+GC                    -> +GC:<len> <bytes> OK  (repeated until +GC:0)
//! ```
//!
//! Every chunk is acknowledged before the next is sent. A cancelled or failed
//! transfer is followed by a best-effort `AT+UA`/`AT+GA`. After a cancel, that
//! abort only gets what is left of the in-flight command's deadline, so the
//! session is released within one `chunk_timeout` of the cancel.

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, EventBus};
use crate::protocol::{Expect, Request, tag};
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per upload chunk.
    pub chunk_size: usize,
    /// Deadline for each transfer command, including chunk acknowledgements.
    pub chunk_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(5),
        }
    }
}

impl TransferConfig {
    /// Set the upload chunk size. Zero is treated as one byte.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the per-command deadline.
    #[must_use]
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host to device.
    Upload,
    /// Device to host.
    Download,
}

/// Bookkeeping for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Direction.
    pub direction: TransferDirection,
    /// Device-side file name.
    pub name: String,
    /// Declared size in bytes.
    pub total: u64,
    /// Bytes moved so far. Never exceeds `total`.
    pub completed: u64,
    /// Upload chunk size.
    pub chunk_size: usize,
}

impl TransferJob {
    /// Start a job with nothing transferred.
    pub fn new(direction: TransferDirection, name: &str, total: u64, chunk_size: usize) -> Self {
        Self {
            direction,
            name: name.to_string(),
            total,
            completed: 0,
            chunk_size,
        }
    }

    /// Bytes still to move.
    pub fn remaining(&self) -> u64 {
        self.total - self.completed
    }

    /// Completion in percent.
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total as f64 * 100.0) as f32
    }

    /// Record `bytes` more as transferred.
    pub fn advance(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.remaining() {
            return Err(Error::ProtocolViolation(format!(
                "{} exceeds its declared {} bytes",
                self.name, self.total
            )));
        }
        self.completed += bytes;
        Ok(())
    }

    fn progress_event(&self) -> DeviceEvent {
        let name = self
            .name
            .clone();
        let percent = self.percent();
        match self.direction {
            TransferDirection::Upload => DeviceEvent::UploadProgress { name, percent },
            TransferDirection::Download => DeviceEvent::DownloadProgress { name, percent },
        }
    }
}

/// One transfer running over a session's dispatcher.
pub(crate) struct Transfer<'a> {
    pub(crate) link: &'a Dispatcher,
    pub(crate) config: &'a TransferConfig,
    pub(crate) events: &'a EventBus,
    pub(crate) cancel: &'a AtomicBool,
}

impl Transfer<'_> {
    /// Upload `size` bytes from `source`. Emits `UploadFinished` either way.
    pub(crate) fn upload(&self, name: &str, source: &mut dyn Read, size: u64) -> Result<()> {
        info!("Uploading {name} ({size} bytes)");
        let result = self.run_upload(name, source, size);
        match &result {
            Ok(()) => info!("Uploaded {name}"),
            Err(e) => warn!("Upload of {name} failed: {e}"),
        }
        self.events
            .emit(&DeviceEvent::UploadFinished {
                name: name.to_string(),
                success: result.is_ok(),
            });
        result
    }

    fn run_upload(&self, name: &str, source: &mut dyn Read, size: u64) -> Result<()> {
        let mut job = TransferJob::new(
            TransferDirection::Upload,
            name,
            size,
            self.config.chunk_size,
        );
        let mut sent = Instant::now();
        self.command(&Request::begin_upload(name, size), &Expect::ack())?;

        let mut source = source.take(size);
        let mut buf = vec![0u8; job.chunk_size];

        while job.remaining() > 0 {
            if self.cancelled() {
                self.abort(&Request::abort_upload(), sent);
                return Err(Error::TransferAborted(format!(
                    "{name} cancelled after {} of {size} bytes",
                    job.completed
                )));
            }

            let want = usize::try_from(job.remaining())
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let read = match read_full(&mut source, &mut buf[..want]) {
                Ok(read) => read,
                Err(e) => {
                    self.abort(&Request::abort_upload(), sent);
                    return Err(e.into());
                },
            };
            if read < want {
                self.abort(&Request::abort_upload(), sent);
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "source for {name} ended after {} of {size} bytes",
                        job.completed + read as u64
                    ),
                )));
            }

            sent = Instant::now();
            let resp = self
                .command(
                    &Request::upload_chunk(buf[..read].to_vec()),
                    &Expect::data(tag::UPLOAD_ACK),
                )
                .inspect_err(|e| {
                    if !e.is_link_fault() {
                        self.abort(&Request::abort_upload(), sent);
                    }
                })?;

            job.advance(read as u64)?;
            let acked = resp.require_u64(tag::UPLOAD_ACK)?;
            if acked != job.completed {
                return Err(Error::ProtocolViolation(format!(
                    "device acknowledged {acked} bytes of {name}, {} were sent",
                    job.completed
                )));
            }
            self.events
                .emit(&job.progress_event());
        }

        self.command(&Request::finish_upload(), &Expect::ack())
            .map(drop)
    }

    /// Download `name` into `sink`. Returns the number of bytes written.
    pub(crate) fn download(&self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        info!("Downloading {name}");
        let mut sent = Instant::now();
        let resp = self.command(&Request::begin_download(name), &Expect::data(tag::DOWNLOAD_SIZE))?;
        let size = resp.require_u64(tag::DOWNLOAD_SIZE)?;
        let mut job = TransferJob::new(
            TransferDirection::Download,
            name,
            size,
            self.config.chunk_size,
        );
        debug!("{name} is {size} bytes");

        loop {
            if self.cancelled() {
                self.abort(&Request::abort_download(), sent);
                return Err(Error::TransferAborted(format!(
                    "{name} cancelled after {} of {size} bytes",
                    job.completed
                )));
            }

            sent = Instant::now();
            let segment = self
                .command(&Request::download_chunk(), &Expect::binary(tag::DOWNLOAD_CHUNK))
                .inspect_err(|e| {
                    if !e.is_link_fault() {
                        self.abort(&Request::abort_download(), sent);
                    }
                })?
                .data;
            if segment.is_empty() {
                break;
            }

            job.advance(segment.len() as u64)?;
            if let Err(e) = sink.write_all(&segment) {
                self.abort(&Request::abort_download(), sent);
                return Err(e.into());
            }
            self.events
                .emit(&job.progress_event());
        }

        if job.remaining() > 0 {
            return Err(Error::ProtocolViolation(format!(
                "{name} ended after {} of {size} bytes",
                job.completed
            )));
        }
        sink.flush()?;
        info!("Downloaded {name} ({size} bytes)");
        Ok(size)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .load(Ordering::SeqCst)
    }

    /// Run one transfer command; a device refusal rejects the whole transfer.
    fn command(&self, request: &Request, expect: &Expect) -> Result<crate::protocol::Response> {
        self.link
            .execute(request, expect, self.config.chunk_timeout)
            .map_err(|e| match e {
                Error::CommandRejected { command, reason } => Error::TransferRejected(
                    reason.unwrap_or_else(|| format!("{command} refused")),
                ),
                other => other,
            })
    }

    /// Best-effort abort. `sent` is when the last transfer command went out;
    /// once cancelled, the abort must finish before that command's deadline.
    fn abort(&self, request: &Request, sent: Instant) {
        let timeout = if self.cancelled() {
            self.config
                .chunk_timeout
                .saturating_sub(sent.elapsed())
        } else {
            self.config.chunk_timeout
        };
        if timeout.is_zero() {
            debug!("No time left to send {}", request.command());
            return;
        }
        debug!("Sending {} ({} ms left)", request.command(), timeout.as_millis());
        if let Err(e) = self
            .link
            .execute(request, &Expect::ack(), timeout)
        {
            debug!("Ignoring failed {}: {e}", request.command());
        }
    }
}

/// Read until `buf` is full or the source is exhausted.
fn read_full(source: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
