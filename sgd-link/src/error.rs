//! Common error types for sgd-link.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Transfer outcomes have their own type, see
//! [`TransferError`](crate::protocol::xmodem::TransferError).

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for sgd-link operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested port does not exist or vanished while opening
    #[error("Serial device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The OS refused access to the port
    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    /// Serial ports cannot be used on this host or with these settings
    #[error("Serial port not supported: {0}")]
    NotSupported(String),

    /// Operation attempted on a closed or lost connection
    #[error("Not connected")]
    NotConnected,

    /// A wait on the inbound buffer exceeded its budget
    #[error("Timed out after {}ms waiting for {what:?}", timeout.as_millis())]
    Timeout { what: String, timeout: Duration },

    /// The device answered, but not as an SGD controller
    #[error("Device verification failed on {0}")]
    NotVerified(String),

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port errors outside of opening a port (enumeration etc.)
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify a failure to open `port` into the open-failure taxonomy.
    pub fn from_open(port: &str, err: tokio_serial::Error) -> Self {
        use tokio_serial::ErrorKind;

        match err.kind {
            ErrorKind::NoDevice => Error::DeviceUnavailable(format!("{port}: {}", err.description)),
            ErrorKind::Io(io::ErrorKind::NotFound) => {
                Error::DeviceUnavailable(format!("{port}: {}", err.description))
            }
            ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Error::PermissionDenied(port.to_string())
            }
            _ => Error::NotSupported(format!("{port}: {}", err.description)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
