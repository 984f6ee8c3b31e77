//! Serial link and configuration uploader for SGD display controllers.
//!
//! The crate is layered the same way the device conversation is:
//!
//! - [`transport`] owns the serial stream, runs the background read task
//!   and matches responses against the inbound buffer.
//! - [`protocol`] speaks to the controller on top of a transport: the
//!   single-byte command idioms and the XMODEM sender.
//! - [`device`] ties one connection and its status together into a
//!   session object that callers hold for as long as they are connected.

pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod reading;
pub mod tracing;
pub mod transport;
