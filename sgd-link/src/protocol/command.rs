//! Single-byte command idioms understood by the controller.
//!
//! Every command follows the same shape: clear the inbound buffer so stale
//! output cannot satisfy the wait, send one ASCII byte, then wait for the
//! markers the firmware prints in reply.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::time;

use crate::error::Result;
use crate::tracing::prelude::*;
use crate::transport::Transport;

/// Ask the controller to identify itself.
pub const VERIFY: u8 = b'W';
/// Ask for both channel readings.
pub const READ: u8 = b'x';
/// Switch into configuration-receive mode.
pub const ENTER_UPLOAD: u8 = b's';
/// Commit the received configuration; the device drops the link afterwards.
pub const COMMIT: u8 = b'm';

pub const VERIFY_MARKER: &str = "SGD";
pub const CHANNEL_1_MARKER: &str = "Rdg1";
pub const CHANNEL_2_MARKER: &str = "Rdg2";
pub const BANNER_MARKER: &str = "XMODEM";
/// Standard XMODEM invite from the receiver.
pub const INVITE_MARKER: &str = "C";

/// What the controller prints between `s` and the start of a transfer.
///
/// Firmware revisions differ: some print a banner containing `XMODEM`
/// before the invite, others go straight to `C`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Handshake {
    /// Wait for the `C` invite only
    #[default]
    Invite,
    /// Wait for the `XMODEM` banner, then for `C`
    #[strum(serialize = "banner")]
    #[serde(rename = "banner")]
    BannerThenInvite,
}

/// Wait budgets and delays for the command idioms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTiming {
    pub verify_timeout: Duration,
    /// Budget for each of the two reading lines
    pub read_timeout: Duration,
    pub invite_timeout: Duration,
    /// Pause between the end of a transfer and `m`
    pub settle_delay: Duration,
    /// Pause after `m` before closing our side
    pub disconnect_grace: Duration,
}

impl Default for CommandTiming {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_millis(2000),
            read_timeout: Duration::from_millis(3000),
            invite_timeout: Duration::from_millis(5000),
            settle_delay: Duration::from_millis(1000),
            disconnect_grace: Duration::from_millis(1000),
        }
    }
}

/// The raw `Rdg1` and `Rdg2` lines from one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReadings {
    pub rdg1: String,
    pub rdg2: String,
}

/// Command idioms over a borrowed transport.
pub struct Commands<'a> {
    transport: &'a Transport,
    timing: &'a CommandTiming,
}

impl<'a> Commands<'a> {
    pub fn new(transport: &'a Transport, timing: &'a CommandTiming) -> Self {
        Self { transport, timing }
    }

    /// Send `W` and look for `SGD`. A timeout means "not an SGD device"
    /// and yields `Ok(false)`; other failures are errors.
    pub async fn verify(&self) -> Result<bool> {
        self.transport.clear_buffer();
        self.transport.send_raw(&[VERIFY]).await?;

        match self
            .transport
            .wait_for_pattern(VERIFY_MARKER, self.timing.verify_timeout)
            .await
        {
            Ok(_) => {
                debug!(port = self.transport.name(), "Device verified");
                Ok(true)
            }
            Err(e) if e.is_timeout() => {
                debug!(port = self.transport.name(), "No verification marker");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Send `x` and collect the `Rdg1` line, then the `Rdg2` line.
    pub async fn read_readings(&self) -> Result<RawReadings> {
        self.transport.clear_buffer();
        self.transport.send_raw(&[READ]).await?;

        let rdg1 = self
            .transport
            .wait_for_line(CHANNEL_1_MARKER, self.timing.read_timeout)
            .await?;
        let rdg2 = self
            .transport
            .wait_for_line(CHANNEL_2_MARKER, self.timing.read_timeout)
            .await?;

        debug!(%rdg1, %rdg2, "Readings received");
        Ok(RawReadings { rdg1, rdg2 })
    }

    /// Put the controller into configuration-receive mode and wait until it
    /// invites a transfer.
    pub async fn enter_upload_mode(&self, handshake: Handshake) -> Result<()> {
        self.transport.clear_buffer();
        self.transport.send_raw(&[ENTER_UPLOAD]).await?;
        // Drop any echo of `s` so it cannot be mistaken for the invite.
        self.transport.clear_buffer();

        if handshake == Handshake::BannerThenInvite {
            self.transport
                .wait_for_pattern(BANNER_MARKER, self.timing.invite_timeout)
                .await?;
        }
        self.transport
            .wait_for_pattern(INVITE_MARKER, self.timing.invite_timeout)
            .await?;

        debug!(%handshake, "Controller ready to receive");
        Ok(())
    }

    /// Commit a finished upload. The controller closes the link by itself
    /// after `m`; this returns once the grace delay has passed so the caller
    /// can close its side.
    pub async fn commit(&self) -> Result<()> {
        time::sleep(self.timing.settle_delay).await;
        self.transport.send_raw(&[COMMIT]).await?;
        time::sleep(self.timing.disconnect_grace).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn link() -> (Transport, DuplexStream) {
        let (host, device) = duplex(256);
        (Transport::from_stream("test", host, None), device)
    }

    async fn expect_byte(device: &mut DuplexStream, expected: u8) {
        let mut byte = [0u8; 1];
        device.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], expected);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_sees_marker() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, VERIFY).await;
            device.write_all(b"W\r\nSGD Display v3\r\n").await.unwrap();
            device
        });

        assert!(Commands::new(&transport, &timing).verify().await.unwrap());
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn verify_without_marker_is_false() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, VERIFY).await;
            device.write_all(b"?\r\n").await.unwrap();
            device
        });

        let started = time::Instant::now();
        assert!(!Commands::new(&transport, &timing).verify().await.unwrap());
        assert!(started.elapsed() >= timing.verify_timeout);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn verify_on_closed_link_errors() {
        let (transport, _device) = link();
        let timing = CommandTiming::default();
        transport.close().await;

        let result = Commands::new(&transport, &timing).verify().await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn readings_in_order() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, READ).await;
            device
                .write_all(b"x\r\nRdg1: ADC = -19428 Digi = 0.00 V\r\n")
                .await
                .unwrap();
            time::sleep(Duration::from_millis(500)).await;
            device
                .write_all(b"Rdg2: ADC = 1200 Digi = 1.25 V\r\n")
                .await
                .unwrap();
            device
        });

        let readings = Commands::new(&transport, &timing)
            .read_readings()
            .await
            .unwrap();

        assert_eq!(readings.rdg1, "Rdg1: ADC = -19428 Digi = 0.00 V");
        assert_eq!(readings.rdg2, "Rdg2: ADC = 1200 Digi = 1.25 V");
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_second_reading_times_out() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, READ).await;
            device.write_all(b"Rdg1: ADC = 1 Digi = 0.10 V\n").await.unwrap();
            device
        });

        let result = Commands::new(&transport, &timing).read_readings().await;
        assert!(matches!(result, Err(Error::Timeout { what, .. }) if what == "Rdg2"));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn banner_handshake_waits_for_both_markers() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, ENTER_UPLOAD).await;
            time::sleep(Duration::from_millis(50)).await;
            device.write_all(b"Start XMODEM now\r\n").await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
            device.write_all(b"C").await.unwrap();
            device
        });

        Commands::new(&transport, &timing)
            .enter_upload_mode(Handshake::BannerThenInvite)
            .await
            .unwrap();
        responder.await.unwrap();
    }

    /// Have the controller emit `text` unprompted and wait until it is buffered.
    async fn preload(transport: &Transport, device: &mut DuplexStream, text: &[u8]) {
        device.write_all(text).await.unwrap();
        while transport.snapshot().len() < text.len() {
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn verify_ignores_stale_marker() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();
        preload(&transport, &mut device, b"SGD C").await;

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, VERIFY).await;
            device
        });

        assert!(!Commands::new(&transport, &timing).verify().await.unwrap());
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn enter_upload_ignores_stale_invite() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();
        preload(&transport, &mut device, b"SGD C").await;

        let responder = tokio::spawn(async move {
            expect_byte(&mut device, ENTER_UPLOAD).await;
            device
        });

        let result = Commands::new(&transport, &timing)
            .enter_upload_mode(Handshake::Invite)
            .await;
        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commit_sends_m_after_settling() {
        let (transport, mut device) = link();
        let timing = CommandTiming::default();

        let started = time::Instant::now();
        Commands::new(&transport, &timing).commit().await.unwrap();

        assert!(started.elapsed() >= timing.settle_delay + timing.disconnect_grace);
        expect_byte(&mut device, COMMIT).await;
    }

    #[test]
    fn handshake_names() {
        assert_eq!("invite".parse::<Handshake>().unwrap(), Handshake::Invite);
        assert_eq!(
            "banner".parse::<Handshake>().unwrap(),
            Handshake::BannerThenInvite
        );
        assert_eq!(Handshake::BannerThenInvite.to_string(), "banner");
    }
}
