//! Physical transport layer for the controller connection.
//!
//! This module owns the duplex byte stream to the device: it opens the
//! serial port, runs the background read task that fills the
//! [`InboundBuffer`], and exposes send and wait primitives without any
//! knowledge of what the bytes mean.

pub mod buffer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, StopBits};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use buffer::InboundBuffer;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Baud rate used by every controller in the device family.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Callback invoked by the read task with each received chunk, decoded
/// lossily as text, for live display.
pub type Observer = Box<dyn Fn(&str) + Send + Sync>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A serial port visible to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// USB vendor and product ID when the port is a USB adapter
    pub usb_id: Option<(u16, u16)>,
    pub product: Option<String>,
}

/// List serial ports the host knows about.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: port.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => PortInfo {
                name: port.port_name,
                usb_id: None,
                product: None,
            },
        })
        .collect())
}

/// Duplex link to one device with buffered response matching.
///
/// The read task runs from construction until [`close`](Self::close), the
/// stream ends, or a read fails. Dropping the transport stops the task too.
pub struct Transport {
    name: String,
    writer: Mutex<Option<Writer>>,
    inbound: Arc<InboundBuffer>,
    shutdown: CancellationToken,
    link_lost: CancellationToken,
    tracker: TaskTracker,
}

impl Transport {
    /// Open `port` at `baud_rate`, 8-N-1, no flow control.
    pub fn open(port: &str, baud_rate: u32, observer: Option<Observer>) -> Result<Self> {
        debug!(port, baud_rate, "Opening serial port");
        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| Error::from_open(port, e))?;
        info!(port, baud_rate, "Serial port open");

        Ok(Self::from_stream(port, stream, observer))
    }

    /// Wrap an already-open byte stream. Must be called from within a tokio
    /// runtime since the read task is spawned immediately.
    pub fn from_stream<S>(name: impl Into<String>, stream: S, observer: Option<Observer>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let inbound = Arc::new(InboundBuffer::new());
        let shutdown = CancellationToken::new();
        let link_lost = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(read_task(
            reader,
            inbound.clone(),
            observer,
            shutdown.clone(),
            link_lost.clone(),
        ));
        tracker.close();

        Self {
            name: name.into(),
            writer: Mutex::new(Some(Box::new(writer))),
            inbound,
            shutdown,
            link_lost,
            tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until the transport is closed or the stream goes away.
    pub fn is_connected(&self) -> bool {
        !self.link_lost.is_cancelled()
    }

    /// Token cancelled once the read task has stopped, for whatever reason.
    pub fn link_lost(&self) -> CancellationToken {
        self.link_lost.clone()
    }

    /// Write `bytes` and flush them immediately.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.is_connected() => writer,
            _ => return Err(Error::NotConnected),
        };

        trace!(port = %self.name, tx = %hex::encode(bytes), "Writing to port.");
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send `line` terminated with CR LF.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.send_raw(&bytes).await
    }

    pub fn clear_buffer(&self) {
        self.inbound.clear();
    }

    /// Unconsumed inbound bytes.
    pub fn snapshot(&self) -> Bytes {
        self.inbound.snapshot()
    }

    pub async fn wait_for_pattern(&self, pattern: &str, timeout: Duration) -> Result<String> {
        self.inbound.wait_for_pattern(pattern, timeout).await
    }

    pub async fn wait_for_line(&self, needle: &str, timeout: Duration) -> Result<String> {
        self.inbound.wait_for_line(needle, timeout).await
    }

    pub async fn wait_for_any_byte(&self, set: &[u8], timeout: Duration) -> Result<u8> {
        self.inbound.wait_for_any_byte(set, timeout).await
    }

    /// Stop the read task and release the stream. Safe to call repeatedly;
    /// teardown failures are logged and otherwise ignored.
    pub async fn close(&self) {
        self.shutdown.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(port = %self.name, error = %e, "Ignoring error while closing writer");
            }
            debug!(port = %self.name, "Serial port closed");
        }

        self.tracker.wait().await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_task<R>(
    mut reader: R,
    inbound: Arc<InboundBuffer>,
    observer: Option<Observer>,
    shutdown: CancellationToken,
    link_lost: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    trace!("Read task started.");
    let mut chunk = [0u8; 256];

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                debug!("Serial stream closed by peer");
                break;
            }
            Ok(n) => {
                let received = &chunk[..n];
                trace!(rx = %hex::encode(received), "Read from port.");
                inbound.append(received);
                if let Some(observer) = &observer {
                    observer(&String::from_utf8_lossy(received));
                }
            }
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                break;
            }
        }
    }

    link_lost.cancel();
    trace!("Read task stopped.");
}
