//! Error types for busytag.

use std::io;
use thiserror::Error;

/// Result type for busytag operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for busytag operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port could not be opened (missing, busy, or access denied).
    #[error("Port unavailable: {port}: {reason}")]
    PortUnavailable {
        /// Port name/path.
        port: String,
        /// Reason reported by the OS.
        reason: String,
    },

    /// The serial link failed mid-session.
    #[error("Link error: {0}")]
    Link(String),

    /// A single command exceeded its deadline.
    #[error("Command timed out: {0}")]
    CommandTimeout(String),

    /// The session has no live connection.
    #[error("Device not connected")]
    NotConnected,

    /// A transfer is in progress on this session.
    #[error("Session busy: a transfer is in progress")]
    SessionBusy,

    /// `connect` was called on a session that is not disconnected.
    #[error("Session already connected to {0}")]
    AlreadyConnected(String),

    /// The device answered in an unexpected shape.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The device answered `ERROR` to a command.
    #[error("Command rejected by device: {command}{}", reason_suffix(.reason))]
    CommandRejected {
        /// Request line that was refused.
        command: String,
        /// Reason given by the device, if any.
        reason: Option<String>,
    },

    /// The transfer was aborted before completion.
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    /// The device refused the transfer.
    #[error("Transfer rejected by device: {0}")]
    TransferRejected(String),

    /// An argument failed host-side validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error on a caller-supplied stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

impl Error {
    /// Whether this error means the link can no longer be trusted.
    ///
    /// Link-severity errors force the session through `Faulted` back to
    /// `Disconnected`.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Self::Link(_) | Self::ProtocolViolation(_))
    }

    /// Build a link error from an I/O error on the serial port.
    pub(crate) fn link(context: &str, err: &io::Error) -> Self {
        Self::Link(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_fault_classification() {
        assert!(Error::Link("gone".into()).is_link_fault());
        assert!(Error::ProtocolViolation("garbage".into()).is_link_fault());
        assert!(!Error::CommandTimeout("AT+GDN".into()).is_link_fault());
        assert!(!Error::NotConnected.is_link_fault());
        assert!(!Error::TransferRejected("NO_SPACE".into()).is_link_fault());
    }

    #[test]
    fn test_command_rejected_display() {
        let err = Error::CommandRejected {
            command: "AT+DF=a.png".into(),
            reason: Some("NOT_FOUND".into()),
        };
        assert_eq!(
            err.to_string(),
            "Command rejected by device: AT+DF=a.png (NOT_FOUND)"
        );

        let err = Error::CommandRejected {
            command: "AT+RST".into(),
            reason: None,
        };
        assert_eq!(err.to_string(), "Command rejected by device: AT+RST");
    }
}
