//! Configuration management for sgd-link.
//!
//! Settings come from, in increasing precedence: built-in defaults, a JSON
//! file, environment variables, and finally command-line flags (applied by
//! the binary). Every field has a default so a file only needs to name what
//! it changes.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{CommandTiming, Handshake, XmodemConfig};
use crate::tracing::prelude::*;
use crate::transport::DEFAULT_BAUD_RATE;

/// Names a JSON config file to load when no path is given explicitly.
pub const CONFIG_ENV: &str = "SGD_LINK_CONFIG";
pub const PORT_ENV: &str = "SGD_LINK_PORT";
pub const BAUD_ENV: &str = "SGD_LINK_BAUD";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Serial port path or name (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port: Option<String>,

    pub baud_rate: u32,

    /// Handshake expected after entering upload mode
    pub handshake: Handshake,

    pub commands: CommandConfig,

    pub xmodem: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            handshake: Handshake::default(),
            commands: CommandConfig::default(),
            xmodem: TransferConfig::default(),
        }
    }
}

/// Command wait budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    pub verify_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub invite_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        let timing = CommandTiming::default();
        Self {
            verify_timeout_ms: millis(timing.verify_timeout),
            read_timeout_ms: millis(timing.read_timeout),
            invite_timeout_ms: millis(timing.invite_timeout),
            settle_delay_ms: millis(timing.settle_delay),
            disconnect_grace_ms: millis(timing.disconnect_grace),
        }
    }
}

/// XMODEM wait budgets, in milliseconds, and the per-packet retry limit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransferConfig {
    pub initial_nak_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub eot_ack_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let xmodem = XmodemConfig::default();
        Self {
            initial_nak_timeout_ms: millis(xmodem.initial_nak_timeout),
            ack_timeout_ms: millis(xmodem.ack_timeout),
            eot_ack_timeout_ms: millis(xmodem.eot_ack_timeout),
            max_retries: xmodem.max_retries,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Config {
    /// Load configuration from the file [`config_path`] finds, or defaults
    /// when there is none, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like [`Config::load`], with an explicit file taking priority.
    pub fn load_with(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match config_path(explicit) {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific JSON file, without environment
    /// overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Override port and baud rate from the environment. Unparseable values
    /// are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(port) = env::var(PORT_ENV) {
            if !port.is_empty() {
                self.port = Some(port);
            }
        }
        if let Ok(baud) = env::var(BAUD_ENV) {
            match baud.parse::<u32>() {
                Ok(baud) if baud > 0 => self.baud_rate = baud,
                _ => warn!(value = %baud, "Ignoring invalid {}", BAUD_ENV),
            }
        }
    }

    /// The configured port, or a configuration error naming how to set one.
    pub fn require_port(&self) -> Result<&str> {
        self.port.as_deref().ok_or_else(|| {
            Error::Config(format!("no serial port given (use --port or {PORT_ENV})"))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be positive".into()));
        }
        Ok(())
    }

    pub fn command_timing(&self) -> CommandTiming {
        let c = &self.commands;
        CommandTiming {
            verify_timeout: Duration::from_millis(c.verify_timeout_ms),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            invite_timeout: Duration::from_millis(c.invite_timeout_ms),
            settle_delay: Duration::from_millis(c.settle_delay_ms),
            disconnect_grace: Duration::from_millis(c.disconnect_grace_ms),
        }
    }

    pub fn xmodem_config(&self) -> XmodemConfig {
        let x = &self.xmodem;
        XmodemConfig {
            initial_nak_timeout: Duration::from_millis(x.initial_nak_timeout_ms),
            ack_timeout: Duration::from_millis(x.ack_timeout_ms),
            eot_ack_timeout: Duration::from_millis(x.eot_ack_timeout_ms),
            max_retries: x.max_retries,
        }
    }
}

/// The config file to read: `explicit` if given, else the one named by
/// `SGD_LINK_CONFIG`, else `sgd-link.json` in the current directory.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(local_config_path)
}

fn local_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("sgd-link.json");
    path.is_file().then_some(path)
}
