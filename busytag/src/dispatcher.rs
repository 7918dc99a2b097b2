//! Request/response dispatch over a single serial channel.
//!
//! The device cannot interleave responses, so at most one command may be in
//! flight. Callers take a ticket and are served strictly in arrival order:
//!
//! ```text
//! caller A ──ticket 0──┐
//! caller B ──ticket 1──┼──> [ FIFO turn ] ──> send line ──> read until OK/ERROR
//! caller C ──ticket 2──┘                           │
//!                                                  └── pushes ──> unsolicited sink
//! ```

use crate::error::{Error, Result};
use crate::protocol::{LineKind, Request, Response, ResponseMatcher, Unsolicited};
use crate::transport::Transport;
use log::{debug, trace, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Receiver for device pushes.
///
/// Called with the channel held; it must not issue commands on the same
/// dispatcher.
pub type UnsolicitedSink = Arc<dyn Fn(Unsolicited) + Send + Sync>;

#[derive(Debug, Default)]
struct Queue {
    next_ticket: u64,
    now_serving: u64,
}

/// Serializes commands over one [`Transport`].
pub struct Dispatcher {
    transport: Mutex<Transport>,
    queue: Mutex<Queue>,
    turn_changed: Condvar,
    sink: Option<UnsolicitedSink>,
}

/// Holding a `Turn` means it is this caller's go; dropping it admits the next.
struct Turn<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut queue = self
            .dispatcher
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.now_serving += 1;
        self.dispatcher
            .turn_changed
            .notify_all();
    }
}

impl Dispatcher {
    /// Take ownership of a transport.
    pub fn new(transport: Transport, sink: Option<UnsolicitedSink>) -> Self {
        Self {
            transport: Mutex::new(transport),
            queue: Mutex::new(Queue::default()),
            turn_changed: Condvar::new(),
            sink,
        }
    }

    fn wait_turn(&self) -> Turn<'_> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        let _queue = self
            .turn_changed
            .wait_while(queue, |q| q.now_serving != ticket)
            .unwrap_or_else(PoisonError::into_inner);
        Turn { dispatcher: self }
    }

    fn lock_transport(&self) -> MutexGuard<'_, Transport> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Port name/path of the underlying transport.
    pub fn port_name(&self) -> String {
        self.lock_transport()
            .name()
            .to_string()
    }

    /// Send `request` and collect its response.
    ///
    /// Fails with [`Error::CommandTimeout`] if `matcher` sees no terminal
    /// line within `timeout`; the channel stays usable afterwards.
    pub fn execute(
        &self,
        request: &Request,
        matcher: &dyn ResponseMatcher,
        timeout: Duration,
    ) -> Result<Response> {
        let _turn = self.wait_turn();
        let mut transport = self.lock_transport();

        self.route_pending(&mut transport)?;

        debug!("Executing {}", request.command());
        transport.send_line(request.line())?;
        if let Some(payload) = request.payload() {
            transport.send(payload)?;
        }

        let timed_out = || {
            Error::CommandTimeout(format!(
                "{} got no response within {} ms",
                request.command(),
                timeout.as_millis()
            ))
        };

        let deadline = Instant::now() + timeout;
        let mut response = Response::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let line = match transport.receive_line(remaining) {
                Ok(line) => line,
                Err(Error::CommandTimeout(_)) => return Err(timed_out()),
                Err(e) => return Err(e),
            };
            if line
                .trim()
                .is_empty()
            {
                continue;
            }

            match matcher.classify(&line) {
                LineKind::Data => response
                    .lines
                    .push(line),
                LineKind::DataWithBytes(len) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let bytes = match transport.receive_exact(len, remaining) {
                        Ok(bytes) => bytes,
                        Err(Error::CommandTimeout(_)) => return Err(timed_out()),
                        Err(e) => return Err(e),
                    };
                    response
                        .lines
                        .push(line);
                    response
                        .data
                        .extend_from_slice(&bytes);
                },
                LineKind::Complete => {
                    trace!("{} complete", request.command());
                    return Ok(response);
                },
                LineKind::Failed(reason) => {
                    debug!("{} rejected: {reason:?}", request.command());
                    return Err(Error::CommandRejected {
                        command: request
                            .line()
                            .to_string(),
                        reason,
                    });
                },
                LineKind::Foreign => self.route_foreign(&line, request)?,
            }
        }
    }

    /// Read and route device pushes for up to `wait` without sending anything.
    ///
    /// Returns the number of pushes delivered to the sink.
    pub fn pump_unsolicited(&self, wait: Duration) -> Result<usize> {
        let _turn = self.wait_turn();
        let mut transport = self.lock_transport();

        let deadline = Instant::now() + wait;
        let mut routed = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match transport.receive_line(remaining) {
                Ok(line) => {
                    if self.deliver(&line) {
                        routed += 1;
                    } else if !line
                        .trim()
                        .is_empty()
                    {
                        debug!("Discarding unexpected idle line: {line}");
                    }
                },
                Err(Error::CommandTimeout(_)) => return Ok(routed),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(routed);
            }
        }
    }

    /// Close the underlying transport. Idempotent.
    pub fn close(&self) {
        self.lock_transport()
            .close();
    }

    /// Whether the underlying transport is still open.
    pub fn is_open(&self) -> bool {
        self.lock_transport()
            .is_open()
    }

    /// Flush lines that arrived between commands before sending a new one.
    ///
    /// Pushes go to the sink. Anything else is a leftover from an earlier
    /// command that timed out and is dropped so it cannot be mistaken for the
    /// next response.
    fn route_pending(&self, transport: &mut Transport) -> Result<()> {
        while let Some(line) = transport.poll_line()? {
            if !self.deliver(&line)
                && !line
                    .trim()
                    .is_empty()
            {
                debug!("Discarding stale line before command: {line}");
            }
        }
        Ok(())
    }

    fn route_foreign(&self, line: &str, request: &Request) -> Result<()> {
        if self.deliver(line) {
            return Ok(());
        }
        warn!(
            "Unexpected line while waiting for {}: {line}",
            request.command()
        );
        Err(Error::ProtocolViolation(format!(
            "unexpected '{line}' in response to {}",
            request.command()
        )))
    }

    /// Hand a line to the sink if it is a recognized push.
    fn deliver(&self, line: &str) -> bool {
        let Some(push) = Unsolicited::parse(line) else {
            return false;
        };
        trace!("Unsolicited: {push:?}");
        if let Some(sink) = &self.sink {
            sink(push);
        }
        true
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("port", &self.port_name())
            .finish_non_exhaustive()
    }
}
