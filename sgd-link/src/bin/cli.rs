//! Command-line interface for sgd-link.
//!
//! This binary drives an SGD display controller over its serial port:
//! listing ports, verifying the device, reading both input channels,
//! uploading a configuration file, and monitoring raw output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use sgd_link::config::Config;
use sgd_link::device::Device;
use sgd_link::protocol::Handshake;
use sgd_link::tracing::{self, prelude::*, LevelFilter};
use sgd_link::transport::{self, Observer};

#[derive(Parser, Debug)]
#[command(name = "sgd-link", version, about = "Talk to SGD display controllers")]
struct Cli {
    /// Serial port (e.g. /dev/ttyUSB0 or COM3)
    #[arg(long, short, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Handshake after entering upload mode: "invite" or "banner"
    #[arg(long, global = true)]
    handshake: Option<Handshake>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Check that an SGD controller answers on the port
    Verify,
    /// Read both input channels
    Read {
        /// Also show the loop current in milliamps
        #[arg(long)]
        current: bool,
    },
    /// Upload a configuration file over XMODEM
    Upload {
        /// Configuration file to send
        file: PathBuf,
    },
    /// Print everything the controller sends; stdin lines are forwarded
    Monitor,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::load_with(self.config.as_deref())?;

        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(handshake) = self.handshake {
            config.handshake = handshake;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing::init_journald_or_stderr(if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    // Listing ports needs no configuration.
    if let Command::Ports = cli.command {
        return ports();
    }

    let config = cli.config()?;
    match cli.command {
        Command::Ports => ports(),
        Command::Verify => verify(&config).await,
        Command::Read { current } => read(&config, current).await,
        Command::Upload { file } => upload(&config, &file).await,
        Command::Monitor => monitor(&config).await,
    }
}

fn ports() -> Result<()> {
    let ports = transport::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match (port.usb_id, port.product) {
            (Some((vid, pid)), Some(product)) => {
                println!("{}  {:04x}:{:04x}  {}", port.name, vid, pid, product)
            }
            (Some((vid, pid)), None) => println!("{}  {:04x}:{:04x}", port.name, vid, pid),
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

async fn verify(config: &Config) -> Result<()> {
    let device = Device::connect_verified(config, None).await?;
    println!("{}: SGD controller verified", device.transport().name());
    device.disconnect().await;
    Ok(())
}

async fn read(config: &Config, current: bool) -> Result<()> {
    let device = Device::connect_verified(config, None).await?;
    let result = device.read_readings().await;
    device.disconnect().await;

    let readings = result.context("reading channels")?;
    for reading in [&readings.rdg1, &readings.rdg2] {
        println!("{reading}");
        if let (true, Some(ma)) = (current, reading.milliamps()) {
            println!("{}: {:.1} mA", reading.channel, ma);
        }
    }
    Ok(())
}

async fn upload(config: &Config, file: &Path) -> Result<()> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let device = Device::connect_verified(config, None).await?;
    info!(file = %file.display(), bytes = payload.len(), "Uploading configuration");

    let result = device
        .upload(&payload, |percent| {
            eprint!("\rUploading: {percent:5.1}%");
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();

    match result {
        Ok(report) => {
            println!(
                "Configuration uploaded ({} bytes, {} packets, {} resends). Device disconnected.",
                report.bytes, report.packets, report.retries
            );
            Ok(())
        }
        Err(e) => {
            device.disconnect().await;
            Err(e).context("upload failed")
        }
    }
}

async fn monitor(config: &Config) -> Result<()> {
    let observer: Observer = Box::new(|text| {
        print!("{text}");
        let _ = std::io::stdout().flush();
    });
    let device = Device::connect(config, Some(observer))?;
    let link_lost = device.transport().link_lost();

    eprintln!("Monitoring {} (Ctrl-C to stop)", device.transport().name());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    // Output goes to the observer; nothing waits on the buffer here.
    let mut drain = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = drain.tick() => device.transport().clear_buffer(),
            _ = tokio::signal::ctrl_c() => break,
            _ = link_lost.cancelled() => {
                warn!("Device closed the connection");
                break;
            }
            // Once stdin closes, keep printing until interrupted.
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => device.transport().send_line(&line).await?,
                Ok(None) => stdin_open = false,
                Err(e) => return Err(e.into()),
            },
        }
    }

    trace!("Shutting down.");
    device.disconnect().await;
    Ok(())
}
