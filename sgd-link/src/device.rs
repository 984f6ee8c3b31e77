//! Connection session for one display controller.
//!
//! A [`Device`] owns the transport for a single connection and publishes
//! its [`ConnectionStatus`] to any number of observers. Nothing here is
//! global: callers create a `Device` when they connect and drop it (or
//! call [`Device::disconnect`]) when they are done.

use std::sync::Arc;
use strum::Display;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{
    CommandTiming, Commands, Handshake, TransferError, TransferReport, XmodemConfig, XmodemSender,
};
use crate::reading::ReadingPair;
use crate::tracing::prelude::*;
use crate::transport::{Observer, Transport};

/// Where a session stands, as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionStatus {
    Disconnected,
    /// Port open, device not yet confirmed
    Connected,
    /// Device answered the verification command
    Verified,
    /// Configuration transfer in progress
    Uploading,
}

/// Settings a session needs once the port is open.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub handshake: Handshake,
    pub commands: CommandTiming,
    pub xmodem: XmodemConfig,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            handshake: config.handshake,
            commands: config.command_timing(),
            xmodem: config.xmodem_config(),
        }
    }
}

/// One live connection to a controller.
pub struct Device {
    transport: Transport,
    settings: SessionSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl Device {
    /// Open the configured port. The device is not verified yet.
    pub fn connect(config: &Config, observer: Option<Observer>) -> Result<Self> {
        let port = config.require_port()?;
        let transport = Transport::open(port, config.baud_rate, observer)?;
        Ok(Self::from_transport(transport, SessionSettings::from(config)))
    }

    /// Open the configured port and verify that an SGD controller answers.
    /// The port is closed again if it does not.
    pub async fn connect_verified(config: &Config, observer: Option<Observer>) -> Result<Self> {
        let device = Self::connect(config, observer)?;
        match device.verify().await {
            Ok(true) => Ok(device),
            Ok(false) => {
                let name = device.transport.name().to_string();
                device.disconnect().await;
                Err(Error::NotVerified(name))
            }
            Err(e) => {
                device.disconnect().await;
                Err(e)
            }
        }
    }

    /// Build a session around an already-open transport.
    pub fn from_transport(transport: Transport, settings: SessionSettings) -> Self {
        let initial = if transport.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        let status = Arc::new(watch::Sender::new(initial));

        // Report a vanished device without waiting for the next command.
        let lost = transport.link_lost();
        let watcher = status.clone();
        tokio::spawn(async move {
            lost.cancelled().await;
            watcher.send_replace(ConnectionStatus::Disconnected);
        });

        Self {
            transport,
            settings,
            status,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.transport.is_connected() || status == ConnectionStatus::Disconnected {
            self.status.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
        }
    }

    fn commands(&self) -> Commands<'_> {
        Commands::new(&self.transport, &self.settings.commands)
    }

    pub async fn verify(&self) -> Result<bool> {
        let verified = self.commands().verify().await?;
        if verified {
            info!(port = self.transport.name(), "Device verified");
            self.set_status(ConnectionStatus::Verified);
        } else {
            warn!(port = self.transport.name(), "Device did not identify as SGD");
        }
        Ok(verified)
    }

    pub async fn read_readings(&self) -> Result<ReadingPair> {
        let raw = self.commands().read_readings().await?;
        Ok(ReadingPair::from(raw))
    }

    /// Upload a configuration payload: enter upload mode, send it over
    /// XMODEM, commit it, and close the connection, which the controller
    /// drops on its side after the commit anyway.
    ///
    /// On failure the connection is left open so the caller may retry the
    /// whole sequence; the transfer always restarts from the first packet.
    pub async fn upload<F>(
        &self,
        payload: &[u8],
        on_progress: F,
    ) -> std::result::Result<TransferReport, TransferError>
    where
        F: FnMut(f32),
    {
        let previous = self.status();
        self.set_status(ConnectionStatus::Uploading);

        let result = self.transfer(payload, on_progress).await;
        match &result {
            Ok(report) => {
                info!(
                    port = self.transport.name(),
                    packets = report.packets,
                    "Configuration uploaded"
                );
                self.disconnect().await;
            }
            Err(e) => {
                error!(port = self.transport.name(), error = %e, "Upload failed");
                self.set_status(previous);
            }
        }
        result
    }

    async fn transfer<F>(
        &self,
        payload: &[u8],
        on_progress: F,
    ) -> std::result::Result<TransferReport, TransferError>
    where
        F: FnMut(f32),
    {
        let commands = self.commands();
        commands.enter_upload_mode(self.settings.handshake).await?;

        let report = XmodemSender::new(&self.transport, self.settings.xmodem.clone())
            .send(payload, on_progress)
            .await?;

        commands.commit().await?;
        Ok(report)
    }

    /// Close the connection. Idempotent; teardown errors are swallowed.
    pub async fn disconnect(&self) {
        self.transport.close().await;
        self.set_status(ConnectionStatus::Disconnected);
        debug!(port = self.transport.name(), "Disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn status_follows_session() {
        let (host, mut peer) = duplex(256);
        let device = Device::from_transport(
            Transport::from_stream("test", host, None),
            SessionSettings::default(),
        );
        let mut changes = device.subscribe();
        assert_eq!(device.status(), ConnectionStatus::Connected);

        let responder = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            peer.read_exact(&mut byte).await.unwrap();
            peer.write_all(b"SGD\r\n").await.unwrap();
            peer
        });

        assert!(device.verify().await.unwrap());
        // Hold the peer open so the link stays up while the status is checked.
        let peer = responder.await.unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), ConnectionStatus::Verified);
        assert_eq!(device.status(), ConnectionStatus::Verified);

        device.disconnect().await;
        drop(peer);
        assert_eq!(device.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn peer_hangup_is_reported() {
        let (host, peer) = duplex(256);
        let device = Device::from_transport(
            Transport::from_stream("test", host, None),
            SessionSettings::default(),
        );
        let mut changes = device.subscribe();

        drop(peer);
        changes
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await
            .unwrap();

        assert!(matches!(
            device.read_readings().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_restores_status() {
        let (host, _peer) = duplex(256);
        let device = Device::from_transport(
            Transport::from_stream("test", host, None),
            SessionSettings::default(),
        );

        let result = device.upload(b"config", |_| {}).await;

        assert!(matches!(
            result,
            Err(TransferError::Link(Error::Timeout { .. }))
        ));
        assert_eq!(device.status(), ConnectionStatus::Connected);
    }
}
