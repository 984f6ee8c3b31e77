//! XMODEM sender.
//!
//! The controller firmware calls this "XMODEM-1K" but receives classic
//! 128-byte SOH blocks with an additive checksum, so that is what goes on
//! the wire: `[SOH, seq, 0xFF - seq, 128 data bytes, checksum]`.

use bytes::{BufMut, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::Encoder;

use crate::error::Error;
use crate::tracing::prelude::*;
use crate::transport::Transport;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Pads the last block
pub const SUB: u8 = 0x1A;

pub const BLOCK_SIZE: usize = 128;
/// SOH + seq + inverse seq + block + checksum
pub const PACKET_LEN: usize = BLOCK_SIZE + 4;

/// Timing and retry limits for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmodemConfig {
    /// How long the receiver may take to send its first NAK
    pub initial_nak_timeout: Duration,
    /// Budget for each ACK/NAK/CAN after a packet
    pub ack_timeout: Duration,
    /// Budget for the optional ACK after EOT
    pub eot_ack_timeout: Duration,
    /// Resends allowed per packet before giving up
    pub max_retries: u32,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            initial_nak_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            eot_ack_timeout: Duration::from_secs(10),
            max_retries: 10,
        }
    }
}

/// Why a transfer ended without completing.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Receiver not ready (no NAK within {}ms)", .0.as_millis())]
    ReceiverNotReady(Duration),

    #[error("Packet {packet} rejected {retries} times, transfer failed")]
    TooManyRetries { packet: usize, retries: u32 },

    #[error("Transfer cancelled by receiver at packet {packet}")]
    Cancelled { packet: usize },

    #[error(transparent)]
    Link(#[from] Error),
}

/// Sequence number carried by the `number`th packet (1-based, wraps).
pub fn sequence_number(number: usize) -> u8 {
    (number % 256) as u8
}

/// Additive checksum over a data block.
pub fn checksum(block: &[u8]) -> u8 {
    block.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Pad `data` with SUB up to a whole number of blocks.
pub fn pad_payload(data: &[u8]) -> Vec<u8> {
    let padded_len = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.resize(padded_len, SUB);
    padded
}

/// One outgoing block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    seq: u8,
    block: [u8; BLOCK_SIZE],
}

impl Packet {
    /// Build the `number`th packet from up to one block of data; a short
    /// block is padded with SUB. Callers slice the payload into blocks first.
    pub(crate) fn new(number: usize, data: &[u8]) -> Self {
        assert!(data.len() <= BLOCK_SIZE, "packet data exceeds block size");
        let mut block = [SUB; BLOCK_SIZE];
        block[..data.len()].copy_from_slice(data);
        Self {
            seq: sequence_number(number),
            block,
        }
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn block(&self) -> &[u8; BLOCK_SIZE] {
        &self.block
    }

    pub fn checksum(&self) -> u8 {
        checksum(&self.block)
    }
}

/// Frames packets for the wire.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<&Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(PACKET_LEN);
        dst.put_u8(SOH);
        dst.put_u8(packet.seq);
        dst.put_u8(0xFF - packet.seq);
        dst.put_slice(&packet.block);
        dst.put_u8(packet.checksum());
        Ok(())
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub packets: usize,
    /// Payload length before padding
    pub bytes: usize,
    /// Resends across the whole transfer
    pub retries: u32,
    pub eot_acknowledged: bool,
}

// Cursor state for one send.
struct TransferSession {
    blocks: Vec<u8>,
    total: usize,
    acknowledged: usize,
    retries: u32,
    total_retries: u32,
}

impl TransferSession {
    fn new(payload: &[u8]) -> Self {
        let blocks = pad_payload(payload);
        let total = blocks.len() / BLOCK_SIZE;
        Self {
            blocks,
            total,
            acknowledged: 0,
            retries: 0,
            total_retries: 0,
        }
    }

    fn packet(&self, number: usize) -> Packet {
        let start = (number - 1) * BLOCK_SIZE;
        Packet::new(number, &self.blocks[start..start + BLOCK_SIZE])
    }

    fn acknowledge(&mut self) -> f32 {
        self.acknowledged += 1;
        self.retries = 0;
        self.acknowledged as f32 / self.total as f32 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitInitialNak,
    SendingPacket(usize),
    AwaitAck(usize),
    SendEot,
    AwaitEotAck,
    Done { eot_acknowledged: bool },
}

/// Sender half of the protocol, borrowing a transport for one transfer.
pub struct XmodemSender<'a> {
    transport: &'a Transport,
    config: XmodemConfig,
}

impl<'a> XmodemSender<'a> {
    pub fn new(transport: &'a Transport, config: XmodemConfig) -> Self {
        Self { transport, config }
    }

    /// Send `payload`, calling `on_progress` with the percentage of packets
    /// acknowledged after each ACK.
    ///
    /// A payload that is already a multiple of the block size is sent as
    /// is; otherwise the last block is padded with SUB.
    pub async fn send<F>(
        &self,
        payload: &[u8],
        mut on_progress: F,
    ) -> Result<TransferReport, TransferError>
    where
        F: FnMut(f32),
    {
        let mut session = TransferSession::new(payload);
        let mut codec = PacketCodec;
        let mut frame = BytesMut::with_capacity(PACKET_LEN);
        let mut state = State::AwaitInitialNak;

        info!(
            bytes = payload.len(),
            packets = session.total,
            "Starting XMODEM transfer"
        );

        loop {
            trace!(?state, "XMODEM state");
            state = match state {
                State::AwaitInitialNak => {
                    self.transport.clear_buffer();
                    match self
                        .transport
                        .wait_for_any_byte(&[NAK], self.config.initial_nak_timeout)
                        .await
                    {
                        Ok(_) => {
                            self.transport.clear_buffer();
                            State::SendingPacket(1)
                        }
                        Err(e) if e.is_timeout() => {
                            return Err(TransferError::ReceiverNotReady(
                                self.config.initial_nak_timeout,
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                State::SendingPacket(n) if n > session.total => State::SendEot,

                State::SendingPacket(n) => {
                    let packet = session.packet(n);
                    frame.clear();
                    codec.encode(&packet, &mut frame).map_err(Error::from)?;
                    self.transport.send_raw(&frame).await?;
                    State::AwaitAck(n)
                }

                State::AwaitAck(n) => {
                    let reply = self
                        .transport
                        .wait_for_any_byte(&[ACK, NAK, CAN], self.config.ack_timeout)
                        .await;
                    self.transport.clear_buffer();

                    match reply {
                        Ok(ACK) => {
                            let percent = session.acknowledge();
                            debug!(packet = n, percent, "Packet acknowledged");
                            on_progress(percent);
                            State::SendingPacket(n + 1)
                        }
                        Ok(CAN) => {
                            warn!(packet = n, "Receiver cancelled transfer");
                            return Err(TransferError::Cancelled { packet: n });
                        }
                        // NAK, or no answer at all: resend the same packet.
                        Ok(_) => self.retry(&mut session, n, "NAK")?,
                        Err(e) if e.is_timeout() => self.retry(&mut session, n, "timeout")?,
                        Err(e) => return Err(e.into()),
                    }
                }

                State::SendEot => {
                    self.transport.send_raw(&[EOT]).await?;
                    State::AwaitEotAck
                }

                State::AwaitEotAck => {
                    match self
                        .transport
                        .wait_for_any_byte(&[ACK], self.config.eot_ack_timeout)
                        .await
                    {
                        Ok(_) => State::Done {
                            eot_acknowledged: true,
                        },
                        Err(e) if e.is_timeout() => {
                            debug!("EOT not acknowledged, treating transfer as complete");
                            State::Done {
                                eot_acknowledged: false,
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                State::Done { eot_acknowledged } => {
                    info!(
                        packets = session.total,
                        retries = session.total_retries,
                        "XMODEM transfer complete"
                    );
                    return Ok(TransferReport {
                        packets: session.total,
                        bytes: payload.len(),
                        retries: session.total_retries,
                        eot_acknowledged,
                    });
                }
            };
        }
    }

    fn retry(
        &self,
        session: &mut TransferSession,
        packet: usize,
        cause: &str,
    ) -> Result<State, TransferError> {
        session.retries += 1;
        session.total_retries += 1;
        if session.retries > self.config.max_retries {
            error!(packet, retries = session.retries, cause, "Giving up on packet");
            return Err(TransferError::TooManyRetries {
                packet,
                retries: session.retries,
            });
        }
        warn!(packet, attempt = session.retries, cause, "Resending packet");
        Ok(State::SendingPacket(packet))
    }
}
