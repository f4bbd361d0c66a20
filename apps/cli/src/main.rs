use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use dfu_core::chooser::InterfaceChooser;
use dfu_core::device::{DeviceIdentity, InterfaceSetting};
use dfu_core::discovery;
use dfu_core::engine::NusbEngine;
use dfu_core::events::{LogLevel, SessionEvent, SessionObserver};
use dfu_core::format;
use dfu_core::session::{DfuSession, SessionConfig};
use dfu_core::state::ConnectionState;

#[derive(Parser, Debug)]
#[command(author, version, about = "USB DFU firmware update tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List DFU interfaces on all visible devices
    List,

    /// Show identity and DFU capabilities of one device
    Info {
        /// Vendor id, hex with a "0x" prefix or decimal
        #[arg(long)]
        vid: Option<String>,

        /// Serial number
        #[arg(long)]
        serial: Option<String>,
    },

    /// Download a firmware image to the device
    Download {
        /// Firmware image file
        firmware: PathBuf,

        /// Vendor id, hex with a "0x" prefix or decimal
        #[arg(long)]
        vid: Option<String>,

        /// Serial number
        #[arg(long)]
        serial: Option<String>,

        /// Transfer chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Session config TOML file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Vendor id in the landing-page convention: hex when "0x"-prefixed,
/// decimal otherwise.
fn parse_vid(value: &str) -> Result<u16> {
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16)
    } else {
        value.parse::<u16>()
    };
    parsed.with_context(|| format!("Bad VID {}", value))
}

/// Strip the single trailing slash some hosts append to the serial
/// query parameter.
fn clean_serial(serial: &str) -> &str {
    serial.strip_suffix('/').unwrap_or(serial)
}

/// Renders the session onto the console: status lines, the error banner
/// and a percent progress bar.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Status(text) if !text.is_empty() => {
                println!("{}", text);
            }
            SessionEvent::Status(_) => {}
            SessionEvent::Banner(message) => {
                eprintln!("error: {}", message);
            }
            SessionEvent::BannerCleared => {}
            SessionEvent::DeviceSummary(summary) | SessionEvent::Capabilities(summary) => {
                println!("{}", summary);
            }
            SessionEvent::Progress { done, total } => {
                let pct = (if *total > 0 { done * 100 / total } else { 0 }) as usize;
                let filled = pct * 60 / 100;
                print!(
                    "\r  Downloading {:3}% [{}{}]",
                    pct,
                    "#".repeat(filled),
                    " ".repeat(60 - filled)
                );
                let _ = io::stdout().flush();
            }
            SessionEvent::DownloadComplete => {
                println!();
                println!("Done!");
            }
            SessionEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            SessionEvent::FirmwarePicker { .. } => {}
            SessionEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

/// Interface chooser prompting on stdin. An empty or invalid answer
/// cancels.
struct StdinChooser;

impl InterfaceChooser for StdinChooser {
    fn choose(&self, choices: &[InterfaceSetting]) -> Option<usize> {
        println!("Multiple DFU interfaces found.");
        for (i, label) in dfu_core::choice_labels(choices).iter().enumerate() {
            println!("  {}) {}", i + 1, label);
        }
        print!("Select interface [1-{}, empty cancels]: ", choices.len());
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return None;
        }
        let choice: usize = line.trim().parse().ok()?;
        (1..=choices.len()).contains(&choice).then(|| choice - 1)
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::List => list(),
        Command::Info { vid, serial } => info_command(vid, serial),
        Command::Download {
            firmware,
            vid,
            serial,
            chunk_size,
            config,
        } => download(firmware, vid, serial, chunk_size, config),
    }
}

fn list() -> Result<()> {
    let engine = NusbEngine::new();
    let targets = discovery::enumerate(&engine)?;
    if targets.is_empty() {
        println!("No device found.");
        return Ok(());
    }
    for target in &targets {
        println!(
            "{}",
            format::device_summary(&target.identity, &target.setting)
        );
    }
    Ok(())
}

fn connect(
    session: &mut DfuSession<NusbEngine, ConsoleObserver>,
    vid: Option<String>,
    serial: Option<String>,
) -> Result<()> {
    let vid = vid.as_deref().map(parse_vid).transpose()?;
    let serial = serial.as_deref().map(clean_serial);

    if vid.is_some() || serial.is_some() {
        session.auto_connect(vid, serial)?;
    } else {
        // No filter given: proceed when exactly one physical device is
        // visible, otherwise ask the operator to narrow it down.
        let engine = NusbEngine::new();
        let targets = discovery::enumerate(&engine)?;
        let mut identities: Vec<&DeviceIdentity> = targets.iter().map(|t| &t.identity).collect();
        identities.dedup();

        match identities.len() {
            0 => println!("No device found."),
            1 => {
                let identity = identities[0].clone();
                session.connect_device(&identity, &StdinChooser)?;
            }
            _ => bail!("multiple devices visible, select one with --vid or --serial"),
        }
    }
    Ok(())
}

fn info_command(vid: Option<String>, serial: Option<String>) -> Result<()> {
    let mut session = DfuSession::with_observer(
        NusbEngine::new(),
        SessionConfig::default(),
        Arc::new(ConsoleObserver),
    );
    connect(&mut session, vid, serial)?;
    if session.state() == ConnectionState::Ready {
        session.disconnect()?;
    }
    Ok(())
}

fn download(
    firmware: PathBuf,
    vid: Option<String>,
    serial: Option<String>,
    chunk_size: Option<usize>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(chunk_size) = chunk_size {
        config.chunk_size = chunk_size;
    }
    let vid = vid.or(config.vendor_id.map(|v| format!("0x{:04x}", v)));
    let serial = serial.or(config.serial.clone());

    let data =
        std::fs::read(&firmware).with_context(|| format!("reading {}", firmware.display()))?;
    info!(
        file = %firmware.display(),
        size = %format::nice_size(data.len() as u64),
        "Loaded firmware"
    );

    let mut session =
        DfuSession::with_observer(NusbEngine::new(), config, Arc::new(ConsoleObserver));
    connect(&mut session, vid, serial)?;
    if session.state() != ConnectionState::Ready {
        bail!("no device connected");
    }

    session.download(&data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vid_hex_and_decimal() {
        assert_eq!(parse_vid("0x0483").unwrap(), 0x0483);
        assert_eq!(parse_vid("0X0483").unwrap(), 0x0483);
        assert_eq!(parse_vid("1155").unwrap(), 1155);
        assert!(parse_vid("0xZZZZ").is_err());
        assert!(parse_vid("notavid").is_err());
    }

    #[test]
    fn test_clean_serial_strips_one_trailing_slash() {
        assert_eq!(clean_serial("ABC123/"), "ABC123");
        assert_eq!(clean_serial("ABC123"), "ABC123");
        assert_eq!(clean_serial("ABC123//"), "ABC123/");
    }
}
