//! Controller protocol implementations.
//!
//! This module speaks to the display controller over a
//! [`Transport`](crate::transport::Transport): the single-byte command
//! idioms used for verification, readings and upload mode, and the XMODEM
//! sender used to deliver configuration files.

pub mod command;
pub mod xmodem;

pub use command::{CommandTiming, Commands, Handshake, RawReadings};
pub use xmodem::{TransferError, TransferReport, XmodemConfig, XmodemSender};
