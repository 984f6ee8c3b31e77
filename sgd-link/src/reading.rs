//! Parsing of the controller's channel readings.
//!
//! The firmware reports each channel as a free-form diagnostic line such as
//! `Rdg1: ADC = -19428 Digi = 0.00 V`. Only the converted voltage (and the
//! raw ADC count, when present) is of interest to callers.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use strum::Display;

use crate::protocol::RawReadings;

/// Milliamps per volt for current-loop inputs.
pub const MILLIAMPS_PER_VOLT: f64 = 10.0;

static VOLTAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Digi\s*=\s*(-?\d+\.?\d*)\s*V").expect("valid regex"));
static ADC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ADC\s*=\s*(-?\d+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Channel {
    #[strum(serialize = "Input 1")]
    One,
    #[strum(serialize = "Input 2")]
    Two,
}

/// One channel reading. `voltage` is `None` when the line carries no
/// recognizable value; the raw line is always kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub channel: Channel,
    pub line: String,
    pub adc: Option<i32>,
    pub voltage: Option<f64>,
}

impl Reading {
    pub fn parse(channel: Channel, line: &str) -> Self {
        let capture = |re: &Regex| re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str());

        Self {
            channel,
            line: line.to_string(),
            adc: capture(&ADC).and_then(|s| s.parse().ok()),
            voltage: capture(&VOLTAGE).and_then(|s| s.parse().ok()),
        }
    }

    /// Voltage formatted the way calibration fields expect, e.g. `1.25`.
    pub fn voltage_text(&self) -> Option<String> {
        self.voltage.map(|v| format!("{v:.2}"))
    }

    /// Loop current implied by the voltage.
    pub fn milliamps(&self) -> Option<f64> {
        self.voltage.map(|v| v * MILLIAMPS_PER_VOLT)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.voltage_text() {
            Some(volts) => write!(f, "{}: {} V ({})", self.channel, volts, self.line),
            None => write!(f, "{}: -- ({})", self.channel, self.line),
        }
    }
}

/// Both channels from one read command.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingPair {
    pub rdg1: Reading,
    pub rdg2: Reading,
}

impl From<RawReadings> for ReadingPair {
    fn from(raw: RawReadings) -> Self {
        Self {
            rdg1: Reading::parse(Channel::One, &raw.rdg1),
            rdg2: Reading::parse(Channel::Two, &raw.rdg2),
        }
    }
}
