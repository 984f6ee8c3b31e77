//! End-to-end session against a simulated controller.

use std::time::Duration;

use sgd_link::device::{ConnectionStatus, Device, SessionSettings};
use sgd_link::protocol::command::{COMMIT, ENTER_UPLOAD, READ, VERIFY};
use sgd_link::protocol::xmodem::{checksum, ACK, BLOCK_SIZE, EOT, NAK, PACKET_LEN, SOH};
use sgd_link::protocol::{Handshake, TransferError};
use sgd_link::transport::Transport;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time;

/// What the simulated controller saw during a session.
#[derive(Debug, Default)]
struct Transcript {
    commands: Vec<u8>,
    blocks: Vec<Vec<u8>>,
    eot: bool,
}

/// Minimal controller firmware: answers `W` and `x`, enters upload mode on
/// `s`, receives XMODEM packets (ACKing each, never ACKing EOT), and hangs
/// up after `m`.
async fn controller(mut port: DuplexStream, banner: bool) -> Transcript {
    let mut transcript = Transcript::default();
    let mut byte = [0u8; 1];

    while port.read_exact(&mut byte).await.is_ok() {
        transcript.commands.push(byte[0]);
        match byte[0] {
            VERIFY => port.write_all(b"W\r\nSGD Gauge fw 2.1\r\n").await.unwrap(),
            READ => {
                port.write_all(b"x\r\nRdg1: ADC = -19428 Digi = 0.00 V\r\n")
                    .await
                    .unwrap();
                port.write_all(b"Rdg2: ADC = 15012 Digi = 1.20 V\r\n")
                    .await
                    .unwrap();
            }
            ENTER_UPLOAD => {
                time::sleep(Duration::from_millis(50)).await;
                if banner {
                    port.write_all(b"Ready for XMODEM\r\n").await.unwrap();
                }
                port.write_all(b"C").await.unwrap();
                time::sleep(Duration::from_millis(100)).await;
                port.write_all(&[NAK]).await.unwrap();
                receive(&mut port, &mut transcript).await;
            }
            COMMIT => break,
            _ => {}
        }
    }
    transcript
}

async fn receive(port: &mut DuplexStream, transcript: &mut Transcript) {
    loop {
        let mut first = [0u8; 1];
        port.read_exact(&mut first).await.unwrap();
        if first[0] == EOT {
            transcript.eot = true;
            return;
        }

        let mut packet = [0u8; PACKET_LEN];
        packet[0] = first[0];
        port.read_exact(&mut packet[1..]).await.unwrap();

        assert_eq!(packet[0], SOH);
        assert_eq!(packet[1], 255 - packet[2]);
        let block = &packet[3..3 + BLOCK_SIZE];
        assert_eq!(packet[PACKET_LEN - 1], checksum(block));

        transcript.blocks.push(block.to_vec());
        port.write_all(&[ACK]).await.unwrap();
    }
}

fn session(handshake: Handshake) -> (Device, DuplexStream) {
    let (host, port) = duplex(4096);
    let settings = SessionSettings {
        handshake,
        ..SessionSettings::default()
    };
    let device = Device::from_transport(Transport::from_stream("sim", host, None), settings);
    (device, port)
}

#[tokio::test(start_paused = true)]
async fn verify_read_and_upload() {
    let (device, port) = session(Handshake::Invite);
    let firmware = tokio::spawn(controller(port, false));

    assert!(device.verify().await.unwrap());
    assert_eq!(device.status(), ConnectionStatus::Verified);

    let readings = device.read_readings().await.unwrap();
    assert_eq!(readings.rdg1.voltage, Some(0.0));
    assert_eq!(readings.rdg2.voltage_text().as_deref(), Some("1.20"));

    let payload: Vec<u8> = (0..1024).map(|i| b'A' + (i % 26) as u8).collect();
    let mut progress = Vec::new();
    let report = device
        .upload(&payload, |percent| progress.push(percent))
        .await
        .unwrap();

    assert_eq!(report.packets, 8);
    assert!(!report.eot_acknowledged);
    assert_eq!(progress.len(), 8);
    assert_eq!(progress.last().copied(), Some(100.0));
    assert_eq!(device.status(), ConnectionStatus::Disconnected);

    let transcript = firmware.await.unwrap();
    assert_eq!(transcript.commands, vec![VERIFY, READ, ENTER_UPLOAD, COMMIT]);
    assert!(transcript.eot);
    assert_eq!(transcript.blocks.concat(), payload);
}

#[tokio::test(start_paused = true)]
async fn short_payload_is_padded() {
    let (device, port) = session(Handshake::BannerThenInvite);
    let firmware = tokio::spawn(controller(port, true));

    let report = device.upload(b"BRT=80\r\n", |_| {}).await.unwrap();
    assert_eq!(report.packets, 1);
    assert_eq!(report.bytes, 8);

    let transcript = firmware.await.unwrap();
    let block = &transcript.blocks[0];
    assert_eq!(&block[..8], b"BRT=80\r\n");
    assert!(block[8..].iter().all(|&b| b == 0x1A));
}

#[tokio::test(start_paused = true)]
async fn silent_controller_never_invites() {
    let (device, mut port) = session(Handshake::Invite);
    let sink = tokio::spawn(async move {
        let mut byte = [0u8; 1];
        port.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], ENTER_UPLOAD);
        port
    });

    let started = time::Instant::now();
    let result = device.upload(b"data", |_| {}).await;

    assert!(matches!(result, Err(TransferError::Link(ref e)) if e.is_timeout()));
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert_eq!(device.status(), ConnectionStatus::Connected);
    drop(sink.await.unwrap());
}
